use std::sync::Arc;

use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::Broadcaster;
use crate::slots::SlotRegistry;
use crate::store::Stores;

use super::BookingError;
use super::conflict::{check_no_conflict, validate_notes, validate_span};

/// Turns a pending booking into a stored appointment, or rolls the slot back.
pub struct AppointmentConfirmer {
    stores: Stores,
    slots: Arc<SlotRegistry>,
    events: Arc<Broadcaster>,
}

impl AppointmentConfirmer {
    pub fn new(stores: Stores, slots: Arc<SlotRegistry>, events: Arc<Broadcaster>) -> Self {
        Self {
            stores,
            slots,
            events,
        }
    }

    /// Both parties must exist.
    pub(crate) async fn check_references(
        &self,
        subject_id: Ulid,
        provider_id: Ulid,
    ) -> Result<(), BookingError> {
        if self.stores.subjects.get(subject_id).await?.is_none() {
            return Err(BookingError::UnknownReference {
                kind: "subject",
                id: subject_id,
            });
        }
        if self.stores.providers.get(provider_id).await?.is_none() {
            return Err(BookingError::UnknownReference {
                kind: "provider",
                id: provider_id,
            });
        }
        Ok(())
    }

    /// Validate and store a new appointment. The overlap check and the
    /// insert run under one collection lock, so two confirmations for the
    /// same provider can never both pass the check.
    pub async fn create_appointment(&self, req: &BookingRequest) -> Result<Appointment, BookingError> {
        self.check_references(req.subject_id, req.provider_id).await?;
        let span = req.span();
        validate_span(&span)?;
        validate_notes(req.notes.as_deref())?;

        let now = now_ms();
        let appointment = Appointment {
            id: Ulid::new(),
            subject_id: req.subject_id,
            provider_id: req.provider_id,
            start: req.start,
            end: req.end,
            status: AppointmentStatus::Confirmed,
            notes: req.notes.clone(),
            created_at: now,
            updated_at: now,
        };
        let record = appointment.clone();
        self.stores
            .appointments
            .modify(move |all| {
                check_no_conflict(all, record.provider_id, &record.span(), None)?;
                all.push(record);
                Ok::<_, BookingError>(())
            })
            .await?;
        Ok(appointment)
    }

    /// Run a queued booking to completion.
    ///
    /// On success the slot becomes Occupied and `booking-occupied` is sent.
    /// On any failure nothing is stored; a still-Reserved slot goes back to
    /// Available and `booking-available` is sent. A slot that is no longer
    /// Reserved is left as it is.
    pub async fn confirm(&self, req: BookingRequest) -> Result<Appointment, BookingError> {
        let key = req.slot_key();
        match self.create_appointment(&req).await {
            Ok(appointment) => {
                self.slots.occupy(key);
                info!("slot {key} occupied by appointment {}", appointment.id);
                self.events.publish(SlotEvent::BookingOccupied {
                    provider_id: key.provider_id,
                    slot: key.start,
                    appointment_id: appointment.id,
                });
                Ok(appointment)
            }
            Err(e) => {
                self.abandon(key, &e.to_string());
                Err(e)
            }
        }
    }

    /// Give up on a pending booking for `key`. A still-Reserved slot goes
    /// back to Available and `booking-available` is sent with `reason`.
    pub fn abandon(&self, key: SlotKey, reason: &str) {
        if self.slots.rollback(key) {
            info!("booking for slot {key} rejected ({reason}), slot released");
            self.events.publish(SlotEvent::BookingAvailable {
                provider_id: key.provider_id,
                slot: key.start,
                reason: Some(reason.to_string()),
            });
        } else {
            warn!(
                "booking for slot {key} rejected ({reason}); slot is {} and was left untouched",
                self.slots.status(&key)
            );
        }
    }
}
