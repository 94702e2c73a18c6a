use std::net::SocketAddr;

use crate::tasks::TaskKind;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests handled. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "slotkeep_http_requests_total";

/// Counter: slot state transitions. Labels: to.
pub const SLOT_TRANSITIONS_TOTAL: &str = "slotkeep_slot_transitions_total";

/// Counter: reserve/book attempts rejected because of slot state. Labels: op.
pub const SLOT_REJECTIONS_TOTAL: &str = "slotkeep_slot_rejections_total";

/// Counter: tasks enqueued. Labels: kind.
pub const TASKS_ENQUEUED_TOTAL: &str = "slotkeep_tasks_enqueued_total";

/// Counter: tasks finished by the worker. Labels: kind, status.
pub const TASKS_PROCESSED_TOTAL: &str = "slotkeep_tasks_processed_total";

/// Histogram: task handling time in seconds. Labels: kind.
pub const TASK_DURATION_SECONDS: &str = "slotkeep_task_duration_seconds";

/// Counter: events handed to subscribers. Labels: type.
pub const EVENTS_PUBLISHED_TOTAL: &str = "slotkeep_events_published_total";

/// Counter: events dropped because a subscriber queue was full.
pub const EVENTS_DROPPED_TOTAL: &str = "slotkeep_events_dropped_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: tasks waiting in the queue.
pub const TASK_QUEUE_DEPTH: &str = "slotkeep_task_queue_depth";

/// Gauge: slot keys held by the registry.
pub const SLOTS_TRACKED: &str = "slotkeep_slots_tracked";

/// Counter: slot keys evicted by the reaper.
pub const SLOTS_EVICTED_TOTAL: &str = "slotkeep_slots_evicted_total";

/// Gauge: connected event-stream subscribers.
pub const SUBSCRIBERS_ACTIVE: &str = "slotkeep_subscribers_active";

/// Counter: collections reset to empty after a failed read. Labels: collection.
pub const STORE_RESETS_TOTAL: &str = "slotkeep_store_resets_total";

/// Histogram: collection write (encode + fsync + rename) duration in seconds.
pub const STORE_WRITE_DURATION_SECONDS: &str = "slotkeep_store_write_duration_seconds";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        tracing::error!("failed to install Prometheus metrics exporter: {e}");
        return;
    }
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a task kind to a short label for metrics.
pub fn task_label(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::ConfirmBooking => "confirm_booking",
        TaskKind::GenerateReport => "generate_report",
        TaskKind::Backup => "backup",
    }
}
