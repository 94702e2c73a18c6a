use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use ulid::Ulid;

use crate::booking::{BookingError, BookingService, SlotQuery};
use crate::catalog::{
    AppointmentPatch, Catalog, NewProvider, NewSubject, NewTemplate, ProviderPatch, SubjectPatch,
    TemplatePatch,
};
use crate::jobs::{entry_path, list_dir};
use crate::model::{BookingRequest, Ms, ReportFilter, SlotKey};
use crate::notify::Broadcaster;
use crate::observability::HTTP_REQUESTS_TOTAL;
use crate::slots::Released;
use crate::tasks::{Task, TaskError, TaskPayload, TaskQueue};

#[derive(Clone)]
pub struct AppState {
    pub booking: Arc<BookingService>,
    pub catalog: Arc<Catalog>,
    pub queue: Arc<TaskQueue>,
    pub events: Arc<Broadcaster>,
    pub reports_dir: PathBuf,
    pub backups_dir: PathBuf,
    /// Cancelled at shutdown; open event streams end with it.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health))
        .route("/slots", get(query_slots))
        .route("/slots/reserve", post(reserve_slot))
        .route("/slots/release", post(release_slot))
        .route("/bookings", post(request_booking))
        .route("/events", get(event_stream))
        .route("/providers", get(list_providers).post(create_provider))
        .route(
            "/providers/:id",
            get(get_provider).put(update_provider).delete(delete_provider),
        )
        .route("/providers/:id/templates", get(list_provider_templates))
        .route("/subjects", get(list_subjects).post(create_subject))
        .route(
            "/subjects/:id",
            get(get_subject).put(update_subject).delete(delete_subject),
        )
        .route("/templates", get(list_templates).post(create_template))
        .route(
            "/templates/:id",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route("/appointments", get(list_appointments).post(create_appointment))
        .route(
            "/appointments/:id",
            get(get_appointment)
                .put(update_appointment)
                .delete(delete_appointment),
        )
        .route("/reports", get(list_reports).post(request_report))
        .route("/reports/:name", get(download_report))
        .route("/backups", get(list_backups).post(request_backup))
        .route("/backups/:name", get(list_backup_files))
        .route("/backups/:name/:file", get(download_backup_file))
        .route_layer(middleware::from_fn(track))
        .with_state(state)
        .layer(cors)
}

async fn track(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let response = next.run(req).await;
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

// ── Errors ───────────────────────────────────────────────────────

/// JSON error body `{"error": "..."}` with a mapped status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<BookingError> for ApiError {
    fn from(e: BookingError) -> Self {
        let status = match &e {
            BookingError::Validation(_) | BookingError::UnknownReference { .. } => {
                StatusCode::BAD_REQUEST
            }
            BookingError::NotFound { .. } => StatusCode::NOT_FOUND,
            BookingError::Conflict(_) | BookingError::SlotUnavailable { .. } => {
                StatusCode::CONFLICT
            }
            BookingError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            BookingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("request failed: {e}");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::Booking(e) => e.into(),
            TaskError::QueueClosed => BookingError::QueueClosed.into(),
            other => {
                tracing::error!("request failed: {other}");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: other.to_string(),
                }
            }
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Io(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Unwrap a JSON body, turning every rejection into a 400.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

// ── Slots & bookings ─────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "slotkeep",
        "subscribers": state.events.subscriber_count(),
    }))
}

#[derive(Debug, Deserialize)]
struct SlotsParams {
    /// Comma separated provider ids.
    providers: Option<String>,
    from: Option<Ms>,
    days: Option<u32>,
}

async fn query_slots(
    State(state): State<AppState>,
    Query(params): Query<SlotsParams>,
) -> ApiResult<impl IntoResponse> {
    let providers = match params.providers.as_deref() {
        None | Some("") => None,
        Some(list) => Some(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    Ulid::from_string(s)
                        .map_err(|e| ApiError::bad_request(format!("invalid provider id {s}: {e}")))
                })
                .collect::<ApiResult<Vec<_>>>()?,
        ),
    };
    let board = state
        .booking
        .query_slots(SlotQuery {
            providers,
            from: params.from,
            days: params.days.unwrap_or(7),
        })
        .await?;
    Ok(Json(board))
}

#[derive(Debug, Deserialize)]
struct SlotRef {
    provider_id: Ulid,
    slot: Ms,
}

async fn reserve_slot(
    State(state): State<AppState>,
    payload: Result<Json<SlotRef>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let slot = body(payload)?;
    let key = SlotKey::new(slot.provider_id, slot.slot);
    state.booking.reserve(key)?;
    Ok(Json(json!({
        "status": "reserved",
        "provider_id": key.provider_id,
        "slot": key.start,
    })))
}

async fn release_slot(
    State(state): State<AppState>,
    payload: Result<Json<SlotRef>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let slot = body(payload)?;
    let key = SlotKey::new(slot.provider_id, slot.slot);
    let released = state.booking.release(key)?;
    Ok(Json(json!({
        "status": "available",
        "changed": released == Released::Freed,
        "provider_id": key.provider_id,
        "slot": key.start,
    })))
}

async fn request_booking(
    State(state): State<AppState>,
    payload: Result<Json<BookingRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = body(payload)?;
    let pending = state.booking.request_booking(req)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "pending",
            "task_id": pending.task_id,
            "slot": pending.slot,
            "provider_id": pending.provider_id,
            "start": pending.start,
        })),
    ))
}

/// Server-sent events. Every message is an unnamed `data:` line holding the
/// `{type, data}` event JSON, so a plain `onmessage` listener sees them all.
async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = state
        .events
        .subscribe()
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(|event| Event::default().json_data(&event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── Providers ────────────────────────────────────────────────────

async fn list_providers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.list_providers().await?))
}

async fn get_provider(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.get_provider(id).await?))
}

async fn create_provider(
    State(state): State<AppState>,
    payload: Result<Json<NewProvider>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let provider = state.catalog.create_provider(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(provider)))
}

async fn update_provider(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    payload: Result<Json<ProviderPatch>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.update_provider(id, body(payload)?).await?))
}

async fn delete_provider(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<StatusCode> {
    state.catalog.delete_provider(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_provider_templates(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.list_templates(Some(id)).await?))
}

// ── Subjects ─────────────────────────────────────────────────────

async fn list_subjects(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.list_subjects().await?))
}

async fn get_subject(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.get_subject(id).await?))
}

async fn create_subject(
    State(state): State<AppState>,
    payload: Result<Json<NewSubject>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let subject = state.catalog.create_subject(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(subject)))
}

async fn update_subject(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    payload: Result<Json<SubjectPatch>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.update_subject(id, body(payload)?).await?))
}

async fn delete_subject(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<StatusCode> {
    state.catalog.delete_subject(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Templates ────────────────────────────────────────────────────

async fn list_templates(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.list_templates(None).await?))
}

async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.get_template(id).await?))
}

async fn create_template(
    State(state): State<AppState>,
    payload: Result<Json<NewTemplate>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let template = state.catalog.create_template(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn update_template(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    payload: Result<Json<TemplatePatch>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.update_template(id, body(payload)?).await?))
}

async fn delete_template(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<StatusCode> {
    state.catalog.delete_template(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AppointmentFilter {
    provider_id: Option<Ulid>,
}

async fn list_appointments(
    State(state): State<AppState>,
    Query(filter): Query<AppointmentFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.list_appointments(filter.provider_id).await?))
}

async fn get_appointment(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.get_appointment(id).await?))
}

async fn create_appointment(
    State(state): State<AppState>,
    payload: Result<Json<BookingRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let appointment = state.catalog.create_appointment(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(appointment)))
}

async fn update_appointment(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    payload: Result<Json<AppointmentPatch>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.catalog.update_appointment(id, body(payload)?).await?))
}

async fn delete_appointment(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<StatusCode> {
    state.catalog.delete_appointment(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Reports & backups ────────────────────────────────────────────

fn enqueue(state: &AppState, payload: TaskPayload) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let task_id = state.queue.enqueue(Task::new(payload))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "pending", "task_id": task_id })),
    ))
}

async fn request_report(
    State(state): State<AppState>,
    payload: Result<Json<ReportFilter>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    enqueue(&state, TaskPayload::GenerateReport(body(payload)?))
}

async fn list_reports(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(list_dir(&state.reports_dir).await?))
}

/// Resolve `name` inside `dir`, refusing names that are not a single
/// plain component.
fn stored_entry(dir: &std::path::Path, kind: &str, name: &str) -> ApiResult<PathBuf> {
    entry_path(dir, name)
        .ok_or_else(|| ApiError::bad_request(format!("invalid {kind} name {name:?}")))
}

/// Read a stored file, mapping a missing one to 404.
async fn read_entry(path: &std::path::Path, kind: &str, name: &str) -> ApiResult<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::not_found(format!("{kind} {name} not found")))
        }
        Err(e) => Err(e.into()),
    }
}

async fn download_report(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let path = stored_entry(&state.reports_dir, "report", &name)?;
    let bytes = read_entry(&path, "report", &name).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], bytes).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct BackupParams {
    #[serde(default)]
    reason: Option<String>,
}

async fn request_backup(
    State(state): State<AppState>,
    payload: Option<Json<BackupParams>>,
) -> ApiResult<impl IntoResponse> {
    let reason = payload
        .and_then(|Json(p)| p.reason)
        .unwrap_or_else(|| "manual".to_string());
    enqueue(&state, TaskPayload::Backup { reason })
}

async fn list_backups(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(list_dir(&state.backups_dir).await?))
}

/// Collection files inside one backup snapshot.
async fn list_backup_files(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let dir = stored_entry(&state.backups_dir, "backup", &name)?;
    match tokio::fs::metadata(&dir).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(ApiError::not_found(format!("backup {name} not found"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found(format!("backup {name} not found")));
        }
        Err(e) => return Err(e.into()),
    }
    Ok(Json(json!({ "name": name, "files": list_dir(&dir).await? })))
}

async fn download_backup_file(
    State(state): State<AppState>,
    Path((name, file)): Path<(String, String)>,
) -> ApiResult<Response> {
    let dir = stored_entry(&state.backups_dir, "backup", &name)?;
    let path = stored_entry(&dir, "backup file", &file)?;
    let bytes = read_entry(&path, "backup file", &format!("{name}/{file}")).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

/// Resolves when the process receives ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("failed to register SIGTERM handler: {e}");
                    ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
