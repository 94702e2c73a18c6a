mod confirm;
mod conflict;
mod error;
mod schedule;
#[cfg(test)]
mod tests;

pub use confirm::AppointmentConfirmer;
pub use error::BookingError;

pub(crate) use conflict::{check_no_conflict, validate_notes, validate_span};
pub(crate) use schedule::validate_template;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use ulid::Ulid;

use crate::limits::{
    MAX_PROVIDERS_PER_QUERY, MAX_QUERY_DAYS, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS,
};
use crate::model::*;
use crate::notify::Broadcaster;
use crate::observability::SLOT_REJECTIONS_TOTAL;
use crate::slots::{Released, SlotRegistry};
use crate::store::Stores;
use crate::tasks::{Task, TaskPayload, TaskQueue};

/// `provider_id -> slot start -> status`.
pub type SlotBoard = BTreeMap<Ulid, BTreeMap<Ms, SlotStatus>>;

#[derive(Debug, Clone, Default)]
pub struct SlotQuery {
    /// Restrict to these providers. `None` means every provider with a template.
    pub providers: Option<Vec<Ulid>>,
    /// Any instant on the first day; defaults to today.
    pub from: Option<Ms>,
    pub days: u32,
}

/// Accepted booking request, still waiting for the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingBooking {
    pub task_id: Ulid,
    pub slot: String,
    pub provider_id: Ulid,
    pub start: Ms,
}

/// Request-path slot operations. Only `request_booking` touches the queue;
/// everything else answers from the registry and stores directly.
pub struct BookingService {
    stores: Stores,
    slots: Arc<SlotRegistry>,
    events: Arc<Broadcaster>,
    queue: Arc<TaskQueue>,
    strict: bool,
}

impl BookingService {
    pub fn new(
        stores: Stores,
        slots: Arc<SlotRegistry>,
        events: Arc<Broadcaster>,
        queue: Arc<TaskQueue>,
        strict: bool,
    ) -> Self {
        Self {
            stores,
            slots,
            events,
            queue,
            strict,
        }
    }

    /// Slot states derived from availability templates.
    ///
    /// An Available slot that already has a confirmed appointment starting
    /// at the same instant is reported as Occupied.
    pub async fn query_slots(&self, query: SlotQuery) -> Result<SlotBoard, BookingError> {
        if query.days == 0 || query.days > MAX_QUERY_DAYS {
            return Err(BookingError::Validation(format!(
                "days must be between 1 and {MAX_QUERY_DAYS}"
            )));
        }
        if let Some(providers) = &query.providers
            && providers.len() > MAX_PROVIDERS_PER_QUERY
        {
            return Err(BookingError::Validation(format!(
                "at most {MAX_PROVIDERS_PER_QUERY} providers per query"
            )));
        }

        let from = query.from.unwrap_or_else(now_ms);
        // The whole window must stay inside the accepted timestamp range
        let latest_from = MAX_VALID_TIMESTAMP_MS - MAX_QUERY_DAYS as Ms * DAY_MS;
        if !(MIN_VALID_TIMESTAMP_MS..=latest_from).contains(&from) {
            return Err(BookingError::Validation(format!(
                "from must be between {MIN_VALID_TIMESTAMP_MS} and {latest_from}, got {from}"
            )));
        }

        let from_day = day_start(from);
        let templates = self.stores.templates.list_all().await?;
        let appointments = self.stores.appointments.list_all().await?;

        let mut by_provider: BTreeMap<Ulid, Vec<AvailabilityTemplate>> = BTreeMap::new();
        if let Some(providers) = &query.providers {
            for p in providers {
                by_provider.entry(*p).or_default();
            }
        }
        for t in templates {
            let wanted = query
                .providers
                .as_ref()
                .is_none_or(|ps| ps.contains(&t.provider_id));
            if wanted {
                by_provider.entry(t.provider_id).or_default().push(t);
            }
        }

        let mut board = SlotBoard::new();
        for (provider_id, templates) in by_provider {
            let mut states = BTreeMap::new();
            for start in schedule::slot_instants(&templates, from_day, query.days) {
                let mut status = self.slots.status(&SlotKey::new(provider_id, start));
                if status == SlotStatus::Available
                    && appointments.iter().any(|a| {
                        a.provider_id == provider_id
                            && a.start == start
                            && a.status == AppointmentStatus::Confirmed
                    })
                {
                    status = SlotStatus::Occupied;
                }
                states.insert(start, status);
            }
            board.insert(provider_id, states);
        }
        Ok(board)
    }

    /// Available → Reserved, or `SlotUnavailable` with the current state.
    pub fn reserve(&self, key: SlotKey) -> Result<(), BookingError> {
        self.slots.reserve(key).map_err(|status| {
            metrics::counter!(SLOT_REJECTIONS_TOTAL, "op" => "reserve").increment(1);
            BookingError::SlotUnavailable { slot: key, status }
        })?;
        info!("slot {key} reserved");
        self.events.publish(SlotEvent::BookingReserved {
            provider_id: key.provider_id,
            slot: key.start,
        });
        Ok(())
    }

    /// Reserved → Available. Already Available is a quiet success; Occupied
    /// is refused.
    pub fn release(&self, key: SlotKey) -> Result<Released, BookingError> {
        let released = self
            .slots
            .release(key)
            .map_err(|status| BookingError::SlotUnavailable { slot: key, status })?;
        if released == Released::Freed {
            info!("slot {key} released");
            self.events.publish(SlotEvent::BookingReleased {
                provider_id: key.provider_id,
                slot: key.start,
            });
        }
        Ok(released)
    }

    /// Hold the slot and queue the confirmation. Returns before any
    /// validation; the outcome arrives later as an event.
    ///
    /// Only an Occupied slot is refused, unless strict booking is on, in
    /// which case a Reserved slot is refused as well.
    pub fn request_booking(&self, req: BookingRequest) -> Result<PendingBooking, BookingError> {
        let key = req.slot_key();
        let previous = self.slots.hold_for_booking(key, self.strict).map_err(|status| {
            metrics::counter!(SLOT_REJECTIONS_TOTAL, "op" => "book").increment(1);
            BookingError::SlotUnavailable { slot: key, status }
        })?;

        let task_id = match self.queue.enqueue(Task::new(TaskPayload::ConfirmBooking(req))) {
            Ok(id) => id,
            Err(_) => {
                if previous == SlotStatus::Available {
                    self.slots.rollback(key);
                }
                return Err(BookingError::QueueClosed);
            }
        };

        if previous == SlotStatus::Available {
            self.events.publish(SlotEvent::BookingReserved {
                provider_id: key.provider_id,
                slot: key.start,
            });
        }
        info!("booking for slot {key} queued as task {task_id}");
        Ok(PendingBooking {
            task_id,
            slot: key.to_string(),
            provider_id: key.provider_id,
            start: key.start,
        })
    }

    pub fn slot_status(&self, key: &SlotKey) -> SlotStatus {
        self.slots.status(key)
    }
}
