use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::{Ms, now_ms};
use crate::observability::SLOTS_EVICTED_TOTAL;
use crate::slots::SlotRegistry;

/// One sweep: forget slot states older than `retention`. Returns the number evicted.
pub fn sweep(slots: &SlotRegistry, now: Ms, retention: Duration) -> usize {
    let retention_ms = Ms::try_from(retention.as_millis()).unwrap_or(Ms::MAX);
    let cutoff = now.saturating_sub(retention_ms);
    let evicted = slots.evict_before(cutoff);
    if evicted > 0 {
        metrics::counter!(SLOTS_EVICTED_TOTAL).increment(evicted as u64);
        info!("evicted {evicted} stale slot states");
    } else {
        debug!("reaper: nothing to evict");
    }
    evicted
}

/// Background task that periodically evicts past slot states until cancelled.
pub async fn run_reaper(
    slots: Arc<SlotRegistry>,
    retention: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep(&slots, now_ms(), retention);
            }
            _ = cancel.cancelled() => {
                debug!("reaper stopped");
                break;
            }
        }
    }
}
