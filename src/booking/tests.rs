use std::time::Duration;

use futures::FutureExt;

use super::conflict::{check_no_conflict, find_conflict, validate_span};
use super::*;
use crate::jobs::{Dispatcher, Jobs};
use crate::notify::Subscription;
use crate::tasks::{TaskError, TaskHandler};

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

// 2024-01-01T00:00:00Z, a Monday
const MONDAY: Ms = 1_704_067_200_000;

struct Fixture {
    stores: Stores,
    slots: Arc<SlotRegistry>,
    events: Arc<Broadcaster>,
    queue: Arc<TaskQueue>,
    confirmer: Arc<AppointmentConfirmer>,
    service: BookingService,
    provider: Ulid,
    subject: Ulid,
}

async fn fixture(strict: bool) -> Fixture {
    let stores = Stores::in_memory();
    let slots = Arc::new(SlotRegistry::new());
    let events = Arc::new(Broadcaster::default());
    let queue = Arc::new(TaskQueue::new());
    let confirmer = Arc::new(AppointmentConfirmer::new(
        stores.clone(),
        slots.clone(),
        events.clone(),
    ));
    let service = BookingService::new(
        stores.clone(),
        slots.clone(),
        events.clone(),
        queue.clone(),
        strict,
    );

    let provider = Provider {
        id: Ulid::new(),
        name: "Dr. Lima".into(),
        specialty: "cardiology".into(),
        email: None,
        phone: None,
        created_at: 0,
        updated_at: 0,
    };
    let subject = Subject {
        id: Ulid::new(),
        name: "Rui".into(),
        document: "000".into(),
        email: None,
        phone: None,
        created_at: 0,
        updated_at: 0,
    };
    stores.providers.save(provider.clone()).await.unwrap();
    stores.subjects.save(subject.clone()).await.unwrap();

    Fixture {
        stores,
        slots,
        events,
        queue,
        confirmer,
        service,
        provider: provider.id,
        subject: subject.id,
    }
}

impl Fixture {
    fn request(&self, start: Ms, end: Ms) -> BookingRequest {
        BookingRequest {
            subject_id: self.subject,
            provider_id: self.provider,
            start,
            end,
            notes: None,
        }
    }

    fn appointment(&self, start: Ms, end: Ms) -> Appointment {
        Appointment {
            id: Ulid::new(),
            subject_id: self.subject,
            provider_id: self.provider,
            start,
            end,
            status: AppointmentStatus::Confirmed,
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn start_worker(&self) {
        let jobs = Arc::new(Jobs::new(
            self.stores.clone(),
            self.events.clone(),
            std::env::temp_dir().join("slotkeep_test_booking").join("reports"),
            std::env::temp_dir().join("slotkeep_test_booking").join("backups"),
        ));
        self.queue
            .start(Arc::new(Dispatcher::new(self.confirmer.clone(), jobs)));
    }
}

async fn next_event(sub: &mut Subscription) -> SlotEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed")
}

// ── Pure conflict checks ─────────────────────────────────

#[test]
fn touching_endpoints_do_not_conflict() {
    let p = Ulid::new();
    let existing = vec![Appointment {
        id: Ulid::new(),
        subject_id: Ulid::new(),
        provider_id: p,
        start: 10 * H,
        end: 11 * H,
        status: AppointmentStatus::Confirmed,
        notes: None,
        created_at: 0,
        updated_at: 0,
    }];

    assert!(check_no_conflict(&existing, p, &Span::new(9 * H, 10 * H), None).is_ok());
    assert!(check_no_conflict(&existing, p, &Span::new(11 * H, 12 * H), None).is_ok());
    assert!(matches!(
        check_no_conflict(&existing, p, &Span::new(9 * H + 30 * M, 10 * H + 30 * M), None),
        Err(BookingError::Conflict(id)) if id == existing[0].id
    ));
    // Containment both ways
    assert!(check_no_conflict(&existing, p, &Span::new(10 * H + 15 * M, 10 * H + 45 * M), None).is_err());
    assert!(check_no_conflict(&existing, p, &Span::new(9 * H, 12 * H), None).is_err());
}

#[test]
fn conflicts_are_per_provider_and_skip_cancelled_and_ignored() {
    let p = Ulid::new();
    let mut a = Appointment {
        id: Ulid::new(),
        subject_id: Ulid::new(),
        provider_id: p,
        start: 10 * H,
        end: 11 * H,
        status: AppointmentStatus::Confirmed,
        notes: None,
        created_at: 0,
        updated_at: 0,
    };
    let span = Span::new(10 * H, 11 * H);

    assert!(find_conflict(std::slice::from_ref(&a), Ulid::new(), &span, None).is_none());
    assert!(find_conflict(std::slice::from_ref(&a), p, &span, Some(a.id)).is_none());
    a.status = AppointmentStatus::Cancelled;
    assert!(find_conflict(std::slice::from_ref(&a), p, &span, None).is_none());
}

#[test]
fn span_validation() {
    assert!(validate_span(&Span::new(10 * H, 11 * H)).is_ok());
    assert!(matches!(
        validate_span(&Span::new(11 * H, 11 * H)),
        Err(BookingError::Validation(_))
    ));
    assert!(validate_span(&Span::new(12 * H, 11 * H)).is_err());
    assert!(validate_span(&Span::new(-5, 10)).is_err());
    assert!(validate_span(&Span::new(0, 25 * H)).is_err());
}

// ── Reserve / release ────────────────────────────────────

#[tokio::test]
async fn reserve_release_cycle_publishes_events() {
    let f = fixture(false).await;
    let mut sub = f.events.subscribe();
    let key = SlotKey::new(f.provider, MONDAY + 9 * H);

    f.service.reserve(key).unwrap();
    assert!(matches!(
        f.service.reserve(key),
        Err(BookingError::SlotUnavailable { status: SlotStatus::Reserved, .. })
    ));
    assert_eq!(f.service.release(key).unwrap(), Released::Freed);
    assert_eq!(f.service.release(key).unwrap(), Released::AlreadyAvailable);

    assert_eq!(
        next_event(&mut sub).await,
        SlotEvent::BookingReserved { provider_id: f.provider, slot: key.start }
    );
    assert_eq!(
        next_event(&mut sub).await,
        SlotEvent::BookingReleased { provider_id: f.provider, slot: key.start }
    );
    // The no-op release sent nothing
    assert!(sub.recv().now_or_never().is_none());
}

#[tokio::test]
async fn release_of_occupied_slot_is_refused() {
    let f = fixture(false).await;
    let key = SlotKey::new(f.provider, MONDAY + 9 * H);
    f.slots.occupy(key);
    assert!(matches!(
        f.service.release(key),
        Err(BookingError::SlotUnavailable { status: SlotStatus::Occupied, .. })
    ));
    assert_eq!(f.service.slot_status(&key), SlotStatus::Occupied);
}

#[tokio::test]
async fn concurrent_reserves_have_one_winner() {
    let f = fixture(false).await;
    let service = Arc::new(f.service);
    let key = SlotKey::new(f.provider, MONDAY + 9 * H);

    let mut handles = Vec::new();
    for _ in 0..32 {
        let service = service.clone();
        handles.push(tokio::spawn(async move { service.reserve(key).is_ok() }));
    }
    let mut wins = 0;
    for h in handles {
        if h.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}

// ── Booking requests ─────────────────────────────────────

#[tokio::test]
async fn booking_request_is_accepted_then_pending() {
    let f = fixture(false).await;
    let req = f.request(MONDAY + 9 * H, MONDAY + 10 * H);
    let pending = f.service.request_booking(req.clone()).unwrap();

    assert_eq!(pending.slot, req.slot_key().to_string());
    assert_eq!(f.service.slot_status(&req.slot_key()), SlotStatus::Reserved);
    // Worker not started: nothing stored yet
    assert!(f.stores.appointments.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn booking_reserved_slot_depends_on_strictness() {
    let lenient = fixture(false).await;
    let req = lenient.request(MONDAY + 9 * H, MONDAY + 10 * H);
    lenient.service.reserve(req.slot_key()).unwrap();
    assert!(lenient.service.request_booking(req).is_ok());

    let strict = fixture(true).await;
    let req = strict.request(MONDAY + 9 * H, MONDAY + 10 * H);
    strict.service.reserve(req.slot_key()).unwrap();
    assert!(matches!(
        strict.service.request_booking(req),
        Err(BookingError::SlotUnavailable { status: SlotStatus::Reserved, .. })
    ));
}

#[tokio::test]
async fn booking_occupied_slot_is_refused() {
    let f = fixture(false).await;
    let req = f.request(MONDAY + 9 * H, MONDAY + 10 * H);
    f.slots.occupy(req.slot_key());
    assert!(matches!(
        f.service.request_booking(req),
        Err(BookingError::SlotUnavailable { status: SlotStatus::Occupied, .. })
    ));
}

#[tokio::test]
async fn closed_queue_rolls_slot_back() {
    let f = fixture(false).await;
    f.start_worker();
    f.queue.stop(Duration::from_secs(5)).await;

    let req = f.request(MONDAY + 9 * H, MONDAY + 10 * H);
    assert!(matches!(
        f.service.request_booking(req.clone()),
        Err(BookingError::QueueClosed)
    ));
    assert_eq!(f.service.slot_status(&req.slot_key()), SlotStatus::Available);
}

/// Panics on every task but rolls back the way the real dispatcher does.
struct PanickingConfirm(Dispatcher);

#[async_trait::async_trait]
impl TaskHandler for PanickingConfirm {
    async fn handle(&self, _task: Task) -> Result<(), TaskError> {
        panic!("confirm blew up");
    }

    fn abandoned(&self, task: &Task, reason: &str) {
        self.0.abandoned(task, reason);
    }
}

#[tokio::test]
async fn panicked_confirm_rolls_slot_back() {
    let f = fixture(false).await;
    let jobs = Arc::new(Jobs::new(
        f.stores.clone(),
        f.events.clone(),
        std::env::temp_dir().join("slotkeep_test_booking").join("reports"),
        std::env::temp_dir().join("slotkeep_test_booking").join("backups"),
    ));
    f.queue.start(Arc::new(PanickingConfirm(Dispatcher::new(
        f.confirmer.clone(),
        jobs,
    ))));
    let mut sub = f.events.subscribe();

    let req = f.request(MONDAY + 9 * H, MONDAY + 10 * H);
    f.service.request_booking(req.clone()).unwrap();

    assert!(matches!(next_event(&mut sub).await, SlotEvent::BookingReserved { .. }));
    match next_event(&mut sub).await {
        SlotEvent::BookingAvailable { slot, reason, .. } => {
            assert_eq!(slot, req.start);
            assert_eq!(reason.as_deref(), Some("task panicked"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(f.service.slot_status(&req.slot_key()), SlotStatus::Available);
    assert!(f.stores.appointments.list_all().await.unwrap().is_empty());
    f.queue.stop(Duration::from_secs(5)).await;
}

// ── Confirmation ─────────────────────────────────────────

#[tokio::test]
async fn confirm_success_stores_and_occupies() {
    let f = fixture(false).await;
    let mut sub = f.events.subscribe();
    let req = f.request(MONDAY + 9 * H, MONDAY + 10 * H);
    f.slots.reserve(req.slot_key()).unwrap();

    let appointment = f.confirmer.confirm(req.clone()).await.unwrap();

    let stored = f.stores.appointments.list_all().await.unwrap();
    assert_eq!(stored, vec![appointment.clone()]);
    assert_eq!(stored[0].status, AppointmentStatus::Confirmed);
    assert_eq!(f.slots.status(&req.slot_key()), SlotStatus::Occupied);
    assert_eq!(
        next_event(&mut sub).await,
        SlotEvent::BookingOccupied {
            provider_id: f.provider,
            slot: req.start,
            appointment_id: appointment.id,
        }
    );
}

#[tokio::test]
async fn confirm_overlap_rolls_back() {
    let f = fixture(false).await;
    f.stores
        .appointments
        .save(f.appointment(MONDAY + 10 * H, MONDAY + 11 * H))
        .await
        .unwrap();
    let mut sub = f.events.subscribe();

    let req = f.request(MONDAY + 9 * H + 30 * M, MONDAY + 10 * H + 30 * M);
    f.slots.reserve(req.slot_key()).unwrap();

    assert!(matches!(
        f.confirmer.confirm(req.clone()).await,
        Err(BookingError::Conflict(_))
    ));
    assert_eq!(f.stores.appointments.list_all().await.unwrap().len(), 1);
    assert_eq!(f.slots.status(&req.slot_key()), SlotStatus::Available);
    match next_event(&mut sub).await {
        SlotEvent::BookingAvailable { provider_id, slot, reason } => {
            assert_eq!(provider_id, f.provider);
            assert_eq!(slot, req.start);
            assert!(reason.unwrap().contains("conflict"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn confirm_adjacent_booking_succeeds() {
    let f = fixture(false).await;
    f.stores
        .appointments
        .save(f.appointment(MONDAY + 10 * H, MONDAY + 11 * H))
        .await
        .unwrap();
    let req = f.request(MONDAY + 9 * H, MONDAY + 10 * H);
    f.slots.reserve(req.slot_key()).unwrap();
    assert!(f.confirmer.confirm(req).await.is_ok());
    assert_eq!(f.stores.appointments.list_all().await.unwrap().len(), 2);
}

#[tokio::test]
async fn confirm_unknown_subject_rolls_back() {
    let f = fixture(false).await;
    let mut req = f.request(MONDAY + 9 * H, MONDAY + 10 * H);
    req.subject_id = Ulid::new();
    f.slots.reserve(req.slot_key()).unwrap();

    assert!(matches!(
        f.confirmer.confirm(req.clone()).await,
        Err(BookingError::UnknownReference { kind: "subject", .. })
    ));
    assert_eq!(f.slots.status(&req.slot_key()), SlotStatus::Available);
    assert!(f.stores.appointments.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn confirm_inverted_span_rolls_back() {
    let f = fixture(false).await;
    let req = f.request(MONDAY + 10 * H, MONDAY + 9 * H);
    f.slots.reserve(req.slot_key()).unwrap();
    assert!(matches!(
        f.confirmer.confirm(req.clone()).await,
        Err(BookingError::Validation(_))
    ));
    assert_eq!(f.slots.status(&req.slot_key()), SlotStatus::Available);
}

#[tokio::test]
async fn failed_confirm_leaves_occupied_slot_alone() {
    let f = fixture(false).await;
    f.stores
        .appointments
        .save(f.appointment(MONDAY + 9 * H, MONDAY + 10 * H))
        .await
        .unwrap();
    let req = f.request(MONDAY + 9 * H, MONDAY + 10 * H);
    f.slots.occupy(req.slot_key());
    let mut sub = f.events.subscribe();

    assert!(f.confirmer.confirm(req.clone()).await.is_err());
    assert_eq!(f.slots.status(&req.slot_key()), SlotStatus::Occupied);
    assert!(sub.recv().now_or_never().is_none());
}

#[tokio::test]
async fn duplicate_bookings_through_worker_yield_one_appointment() {
    let f = fixture(false).await;
    let mut sub = f.events.subscribe();
    f.start_worker();

    let req = f.request(MONDAY + 9 * H, MONDAY + 10 * H);
    f.service.request_booking(req.clone()).unwrap();
    f.service.request_booking(req.clone()).unwrap();
    f.queue.stop(Duration::from_secs(5)).await;

    assert_eq!(f.stores.appointments.list_all().await.unwrap().len(), 1);
    assert_eq!(f.slots.status(&req.slot_key()), SlotStatus::Occupied);

    assert!(matches!(next_event(&mut sub).await, SlotEvent::BookingReserved { .. }));
    assert!(matches!(next_event(&mut sub).await, SlotEvent::BookingOccupied { .. }));
    // The second confirmation conflicted, but the slot was no longer Reserved
    assert!(sub.recv().now_or_never().is_none());
}

// ── Slot queries ─────────────────────────────────────────

#[tokio::test]
async fn query_derives_slots_from_templates() {
    let f = fixture(false).await;
    f.stores
        .templates
        .save(AvailabilityTemplate {
            id: Ulid::new(),
            provider_id: f.provider,
            weekday: 0,
            start_minute: 9 * 60,
            end_minute: 11 * 60,
            slot_minutes: Some(60),
        })
        .await
        .unwrap();
    f.stores
        .appointments
        .save(f.appointment(MONDAY + 10 * H, MONDAY + 11 * H))
        .await
        .unwrap();
    f.slots.reserve(SlotKey::new(f.provider, MONDAY + 9 * H)).unwrap();

    let board = f
        .service
        .query_slots(SlotQuery {
            providers: None,
            from: Some(MONDAY + 5 * H),
            days: 7,
        })
        .await
        .unwrap();

    let slots = &board[&f.provider];
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[&(MONDAY + 9 * H)], SlotStatus::Reserved);
    assert_eq!(slots[&(MONDAY + 10 * H)], SlotStatus::Occupied);
}

#[tokio::test]
async fn query_includes_requested_provider_without_templates() {
    let f = fixture(false).await;
    let other = Ulid::new();
    let board = f
        .service
        .query_slots(SlotQuery {
            providers: Some(vec![other]),
            from: Some(MONDAY),
            days: 1,
        })
        .await
        .unwrap();
    assert_eq!(board.len(), 1);
    assert!(board[&other].is_empty());
}

#[tokio::test]
async fn query_rejects_bad_window() {
    let f = fixture(false).await;
    let query = SlotQuery {
        providers: None,
        from: None,
        days: 0,
    };
    assert!(matches!(
        f.service.query_slots(query).await,
        Err(BookingError::Validation(_))
    ));
}


#[tokio::test]
async fn query_rejects_from_outside_timestamp_range() {
    let f = fixture(false).await;
    for from in [i64::MAX - 1, i64::MAX, i64::MIN, -1] {
        let query = SlotQuery {
            providers: None,
            from: Some(from),
            days: 7,
        };
        assert!(
            matches!(
                f.service.query_slots(query).await,
                Err(BookingError::Validation(_))
            ),
            "from = {from}"
        );
    }

    // The last accepted window still answers
    let latest = crate::limits::MAX_VALID_TIMESTAMP_MS - MAX_QUERY_DAYS as Ms * DAY_MS;
    let query = SlotQuery {
        providers: None,
        from: Some(latest),
        days: MAX_QUERY_DAYS,
    };
    assert!(f.service.query_slots(query).await.is_ok());
}
