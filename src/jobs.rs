use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use ulid::Ulid;

use crate::booking::AppointmentConfirmer;
use crate::model::*;
use crate::notify::Broadcaster;
use crate::store::Stores;
use crate::tasks::{Task, TaskError, TaskHandler, TaskPayload};

#[derive(Debug, Serialize)]
struct ReportRow {
    appointment_id: Ulid,
    provider_id: Ulid,
    subject_id: Ulid,
    start: Ms,
    end: Ms,
    status: AppointmentStatus,
}

#[derive(Debug, Serialize)]
struct Report {
    generated_at: Ms,
    provider: String,
    from: Option<Ms>,
    to: Option<Ms>,
    total: usize,
    rows: Vec<ReportRow>,
}

/// Report and backup work executed by the task worker.
pub struct Jobs {
    stores: Stores,
    events: Arc<Broadcaster>,
    reports_dir: PathBuf,
    backups_dir: PathBuf,
}

impl Jobs {
    pub fn new(
        stores: Stores,
        events: Arc<Broadcaster>,
        reports_dir: PathBuf,
        backups_dir: PathBuf,
    ) -> Self {
        Self {
            stores,
            events,
            reports_dir,
            backups_dir,
        }
    }

    /// Write a JSON summary of the appointments matching `filter`.
    ///
    /// An appointment is in the period when it starts at or after `from`
    /// and ends at or before `to`; either bound may be absent. Returns the
    /// written file.
    pub async fn generate_report(&self, filter: ReportFilter) -> Result<PathBuf, TaskError> {
        let appointments = self.stores.appointments.list_all().await?;
        let provider = match filter.provider_id {
            Some(id) => self
                .stores
                .providers
                .get(id)
                .await?
                .map(|p| p.name)
                .unwrap_or_else(|| id.to_string()),
            None => "all".to_string(),
        };

        let mut rows: Vec<ReportRow> = appointments
            .into_iter()
            .filter(|a| filter.provider_id.is_none_or(|p| a.provider_id == p))
            .filter(|a| filter.from.is_none_or(|from| a.start >= from))
            .filter(|a| filter.to.is_none_or(|to| a.end <= to))
            .map(|a| ReportRow {
                appointment_id: a.id,
                provider_id: a.provider_id,
                subject_id: a.subject_id,
                start: a.start,
                end: a.end,
                status: a.status,
            })
            .collect();
        rows.sort_by_key(|r| r.start);

        let generated_at = now_ms();
        let report = Report {
            generated_at,
            provider,
            from: filter.from,
            to: filter.to,
            total: rows.len(),
            rows,
        };
        let body = serde_json::to_vec_pretty(&report)
            .map_err(|e| TaskError::Io(std::io::Error::other(e)))?;

        tokio::fs::create_dir_all(&self.reports_dir).await?;
        let path = self
            .reports_dir
            .join(format!("report_{generated_at}_{}.json", Ulid::new()));
        tokio::fs::write(&path, body).await?;

        info!("report written to {} ({} rows)", path.display(), report.total);
        self.events.publish(SlotEvent::ReportReady {
            file: file_name(&path),
        });
        Ok(path)
    }

    /// Snapshot every collection into a fresh timestamped directory.
    pub async fn backup(&self, reason: &str) -> Result<PathBuf, TaskError> {
        let dir = self
            .backups_dir
            .join(format!("backup_{}_{}", now_ms(), Ulid::new()));
        tokio::fs::create_dir_all(&dir).await?;

        let s = &self.stores;
        s.providers.export(&dir.join("providers.bin")).await?;
        s.subjects.export(&dir.join("subjects.bin")).await?;
        s.templates.export(&dir.join("templates.bin")).await?;
        s.appointments.export(&dir.join("appointments.bin")).await?;

        info!("backup ({reason}) written to {}", dir.display());
        self.events.publish(SlotEvent::BackupCompleted {
            dir: file_name(&dir),
            reason: reason.to_string(),
        });
        Ok(dir)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `dir/name`, provided `name` is one plain path component. Names that
/// could climb out of `dir` yield `None`.
pub fn entry_path(dir: &Path, name: &str) -> Option<PathBuf> {
    let plain = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..");
    plain.then(|| dir.join(name))
}

/// List entries of `dir`, newest name last. A missing directory is empty.
pub async fn list_dir(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Routes each task to the component that handles its kind.
pub struct Dispatcher {
    confirmer: Arc<AppointmentConfirmer>,
    jobs: Arc<Jobs>,
}

impl Dispatcher {
    pub fn new(confirmer: Arc<AppointmentConfirmer>, jobs: Arc<Jobs>) -> Self {
        Self { confirmer, jobs }
    }
}

#[async_trait]
impl TaskHandler for Dispatcher {
    async fn handle(&self, task: Task) -> Result<(), TaskError> {
        match task.payload {
            TaskPayload::ConfirmBooking(req) => {
                self.confirmer.confirm(req).await?;
            }
            TaskPayload::GenerateReport(filter) => {
                self.jobs.generate_report(filter).await?;
            }
            TaskPayload::Backup { reason } => {
                self.jobs.backup(&reason).await?;
            }
        }
        Ok(())
    }

    fn abandoned(&self, task: &Task, reason: &str) {
        // A booking that died mid-confirm must not leave its slot Reserved
        if let TaskPayload::ConfirmBooking(req) = &task.payload {
            self.confirmer.abandon(req.slot_key(), reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Repository;

    const H: Ms = 3_600_000;

    fn test_dir(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join("slotkeep_test_jobs")
            .join(format!("{name}_{}", Ulid::new()))
    }

    fn appointment(provider_id: Ulid, start: Ms, end: Ms) -> Appointment {
        Appointment {
            id: Ulid::new(),
            subject_id: Ulid::new(),
            provider_id,
            start,
            end,
            status: AppointmentStatus::Confirmed,
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn report_filters_by_provider_and_period() {
        let dir = test_dir("report");
        let stores = Stores::in_memory();
        let events = Arc::new(Broadcaster::default());
        let mut sub = events.subscribe();
        let jobs = Jobs::new(stores.clone(), events.clone(), dir.join("reports"), dir.join("backups"));

        let p = Ulid::new();
        stores.appointments.save(appointment(p, 10 * H, 11 * H)).await.unwrap();
        stores.appointments.save(appointment(p, 30 * H, 31 * H)).await.unwrap();
        stores
            .appointments
            .save(appointment(Ulid::new(), 10 * H, 11 * H))
            .await
            .unwrap();

        let path = jobs
            .generate_report(ReportFilter {
                provider_id: Some(p),
                from: Some(0),
                to: Some(24 * H),
            })
            .await
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["rows"][0]["start"], 10 * H);

        match sub.recv().await {
            Some(SlotEvent::ReportReady { file }) => assert_eq!(file, file_name(&path)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn report_period_bounds_are_inclusive_of_touching_appointments() {
        let dir = test_dir("report_bounds");
        let stores = Stores::in_memory();
        let jobs = Jobs::new(
            stores.clone(),
            Arc::new(Broadcaster::default()),
            dir.join("reports"),
            dir.join("backups"),
        );

        let p = Ulid::new();
        // Ends exactly at `to`: in
        stores.appointments.save(appointment(p, 23 * H, 24 * H)).await.unwrap();
        // Starts exactly at `from`: in
        stores.appointments.save(appointment(p, 0, H)).await.unwrap();
        // Crosses `to`: out
        stores.appointments.save(appointment(p, 24 * H - H / 2, 24 * H + H / 2)).await.unwrap();
        // Starts before `from`: out
        stores.appointments.save(appointment(p, -H / 2, H / 2)).await.unwrap();

        let path = jobs
            .generate_report(ReportFilter {
                provider_id: None,
                from: Some(0),
                to: Some(24 * H),
            })
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["total"], 2);
        assert_eq!(json["rows"][0]["start"], 0);
        assert_eq!(json["rows"][1]["end"], 24 * H);
    }

    #[tokio::test]
    async fn backup_snapshots_every_collection() {
        let dir = test_dir("backup");
        let data = dir.join("data");
        let stores = Stores::open(&data).unwrap();
        let events = Arc::new(Broadcaster::default());
        let jobs = Jobs::new(stores.clone(), events, dir.join("reports"), dir.join("backups"));

        let a = appointment(Ulid::new(), H, 2 * H);
        stores.appointments.save(a.clone()).await.unwrap();

        let out = jobs.backup("manual").await.unwrap();
        for name in ["providers.bin", "subjects.bin", "templates.bin", "appointments.bin"] {
            assert!(out.join(name).exists(), "{name} missing");
        }

        // The snapshot reads back as a regular collection
        let copy: Repository<Appointment> = Repository::open_file(&out, "appointments").unwrap();
        assert_eq!(copy.list_all().await.unwrap(), vec![a]);

        let listed = list_dir(&dir.join("backups")).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn entry_names_stay_inside_their_directory() {
        let dir = Path::new("/srv/reports");
        assert_eq!(
            entry_path(dir, "report_1_x.json"),
            Some(dir.join("report_1_x.json"))
        );
        for name in ["", ".", "..", "../data", "a/b", "..\\x", "x..y", ".hidden", "/etc/passwd"] {
            assert_eq!(entry_path(dir, name), None, "{name:?} accepted");
        }
    }

    #[tokio::test]
    async fn list_missing_dir_is_empty() {
        assert!(list_dir(&test_dir("missing")).await.unwrap().is_empty());
    }
}
