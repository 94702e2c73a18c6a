use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use ulid::Ulid;

use crate::booking::{
    AppointmentConfirmer, BookingError, check_no_conflict, validate_notes, validate_span,
    validate_template,
};
use crate::limits::MAX_NAME_LEN;
use crate::model::*;
use crate::notify::Broadcaster;
use crate::slots::SlotRegistry;
use crate::store::Stores;

#[derive(Debug, Clone, Deserialize)]
pub struct NewProvider {
    pub name: String,
    pub specialty: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubject {
    pub name: String,
    pub document: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTemplate {
    pub provider_id: Ulid,
    pub weekday: u8,
    pub start_minute: u32,
    pub end_minute: u32,
    #[serde(default)]
    pub slot_minutes: Option<u32>,
}

/// Partial updates; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub specialty: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubjectPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// The provider of a template is fixed; only the window may change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplatePatch {
    #[serde(default)]
    pub weekday: Option<u8>,
    #[serde(default)]
    pub start_minute: Option<u32>,
    #[serde(default)]
    pub end_minute: Option<u32>,
    #[serde(default)]
    pub slot_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppointmentPatch {
    #[serde(default)]
    pub start: Option<Ms>,
    #[serde(default)]
    pub end: Option<Ms>,
    #[serde(default)]
    pub status: Option<AppointmentStatus>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn validate_name(field: &str, value: &str) -> Result<(), BookingError> {
    if value.trim().is_empty() {
        return Err(BookingError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(BookingError::Validation(format!("{field} too long")));
    }
    Ok(())
}

/// Synchronous CRUD over providers, subjects, templates and appointments.
pub struct Catalog {
    stores: Stores,
    confirmer: Arc<AppointmentConfirmer>,
    slots: Arc<SlotRegistry>,
    events: Arc<Broadcaster>,
}

impl Catalog {
    pub fn new(
        stores: Stores,
        confirmer: Arc<AppointmentConfirmer>,
        slots: Arc<SlotRegistry>,
        events: Arc<Broadcaster>,
    ) -> Self {
        Self {
            stores,
            confirmer,
            slots,
            events,
        }
    }

    // ── Providers ────────────────────────────────────────────

    pub async fn list_providers(&self) -> Result<Vec<Provider>, BookingError> {
        Ok(self.stores.providers.list_all().await?)
    }

    pub async fn get_provider(&self, id: Ulid) -> Result<Provider, BookingError> {
        self.stores
            .providers
            .get(id)
            .await?
            .ok_or(BookingError::NotFound { kind: "provider", id })
    }

    pub async fn create_provider(&self, new: NewProvider) -> Result<Provider, BookingError> {
        validate_name("name", &new.name)?;
        validate_name("specialty", &new.specialty)?;
        let now = now_ms();
        let provider = Provider {
            id: Ulid::new(),
            name: new.name,
            specialty: new.specialty,
            email: new.email,
            phone: new.phone,
            created_at: now,
            updated_at: now,
        };
        self.stores.providers.save(provider.clone()).await?;
        info!("provider {} created", provider.id);
        Ok(provider)
    }

    pub async fn update_provider(&self, id: Ulid, patch: ProviderPatch) -> Result<Provider, BookingError> {
        if let Some(name) = &patch.name {
            validate_name("name", name)?;
        }
        if let Some(specialty) = &patch.specialty {
            validate_name("specialty", specialty)?;
        }
        let provider = self
            .stores
            .providers
            .modify(move |all| {
                let p = all
                    .iter_mut()
                    .find(|p| p.id == id)
                    .ok_or(BookingError::NotFound { kind: "provider", id })?;
                if let Some(name) = patch.name {
                    p.name = name;
                }
                if let Some(specialty) = patch.specialty {
                    p.specialty = specialty;
                }
                if patch.email.is_some() {
                    p.email = patch.email;
                }
                if patch.phone.is_some() {
                    p.phone = patch.phone;
                }
                p.updated_at = now_ms();
                Ok::<_, BookingError>(p.clone())
            })
            .await?;
        info!("provider {id} updated");
        Ok(provider)
    }

    /// Deletes the provider together with its availability templates.
    pub async fn delete_provider(&self, id: Ulid) -> Result<(), BookingError> {
        if !self.stores.providers.delete(id).await? {
            return Err(BookingError::NotFound { kind: "provider", id });
        }
        let removed = self
            .stores
            .templates
            .modify(move |all| {
                let before = all.len();
                all.retain(|t| t.provider_id != id);
                Ok::<_, BookingError>(before - all.len())
            })
            .await?;
        if removed > 0 {
            self.events
                .publish(SlotEvent::AvailabilityChanged { provider_id: id });
        }
        info!("provider {id} deleted ({removed} templates removed)");
        Ok(())
    }

    // ── Subjects ─────────────────────────────────────────────

    pub async fn list_subjects(&self) -> Result<Vec<Subject>, BookingError> {
        Ok(self.stores.subjects.list_all().await?)
    }

    pub async fn get_subject(&self, id: Ulid) -> Result<Subject, BookingError> {
        self.stores
            .subjects
            .get(id)
            .await?
            .ok_or(BookingError::NotFound { kind: "subject", id })
    }

    pub async fn create_subject(&self, new: NewSubject) -> Result<Subject, BookingError> {
        validate_name("name", &new.name)?;
        validate_name("document", &new.document)?;
        let now = now_ms();
        let subject = Subject {
            id: Ulid::new(),
            name: new.name,
            document: new.document,
            email: new.email,
            phone: new.phone,
            created_at: now,
            updated_at: now,
        };
        self.stores.subjects.save(subject.clone()).await?;
        info!("subject {} created", subject.id);
        Ok(subject)
    }

    pub async fn update_subject(&self, id: Ulid, patch: SubjectPatch) -> Result<Subject, BookingError> {
        if let Some(name) = &patch.name {
            validate_name("name", name)?;
        }
        if let Some(document) = &patch.document {
            validate_name("document", document)?;
        }
        let subject = self
            .stores
            .subjects
            .modify(move |all| {
                let s = all
                    .iter_mut()
                    .find(|s| s.id == id)
                    .ok_or(BookingError::NotFound { kind: "subject", id })?;
                if let Some(name) = patch.name {
                    s.name = name;
                }
                if let Some(document) = patch.document {
                    s.document = document;
                }
                if patch.email.is_some() {
                    s.email = patch.email;
                }
                if patch.phone.is_some() {
                    s.phone = patch.phone;
                }
                s.updated_at = now_ms();
                Ok::<_, BookingError>(s.clone())
            })
            .await?;
        info!("subject {id} updated");
        Ok(subject)
    }

    pub async fn delete_subject(&self, id: Ulid) -> Result<(), BookingError> {
        if !self.stores.subjects.delete(id).await? {
            return Err(BookingError::NotFound { kind: "subject", id });
        }
        Ok(())
    }

    // ── Availability templates ───────────────────────────────

    pub async fn list_templates(
        &self,
        provider_id: Option<Ulid>,
    ) -> Result<Vec<AvailabilityTemplate>, BookingError> {
        Ok(self
            .stores
            .templates
            .read(move |all| {
                all.iter()
                    .filter(|t| provider_id.is_none_or(|p| t.provider_id == p))
                    .cloned()
                    .collect()
            })
            .await?)
    }

    pub async fn get_template(&self, id: Ulid) -> Result<AvailabilityTemplate, BookingError> {
        self.stores
            .templates
            .get(id)
            .await?
            .ok_or(BookingError::NotFound { kind: "template", id })
    }

    pub async fn create_template(&self, new: NewTemplate) -> Result<AvailabilityTemplate, BookingError> {
        if self.stores.providers.get(new.provider_id).await?.is_none() {
            return Err(BookingError::UnknownReference {
                kind: "provider",
                id: new.provider_id,
            });
        }
        let template = AvailabilityTemplate {
            id: Ulid::new(),
            provider_id: new.provider_id,
            weekday: new.weekday,
            start_minute: new.start_minute,
            end_minute: new.end_minute,
            slot_minutes: new.slot_minutes,
        };
        validate_template(&template)?;
        self.stores.templates.save(template.clone()).await?;
        self.events.publish(SlotEvent::AvailabilityChanged {
            provider_id: template.provider_id,
        });
        Ok(template)
    }

    /// Change a template's window. The result is validated before it is
    /// stored; subscribers are told the provider's availability changed.
    pub async fn update_template(
        &self,
        id: Ulid,
        patch: TemplatePatch,
    ) -> Result<AvailabilityTemplate, BookingError> {
        let template = self
            .stores
            .templates
            .modify(move |all| {
                let t = all
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or(BookingError::NotFound { kind: "template", id })?;
                let mut next = t.clone();
                next.weekday = patch.weekday.unwrap_or(next.weekday);
                next.start_minute = patch.start_minute.unwrap_or(next.start_minute);
                next.end_minute = patch.end_minute.unwrap_or(next.end_minute);
                if patch.slot_minutes.is_some() {
                    next.slot_minutes = patch.slot_minutes;
                }
                validate_template(&next)?;
                *t = next.clone();
                Ok::<_, BookingError>(next)
            })
            .await?;
        self.events.publish(SlotEvent::AvailabilityChanged {
            provider_id: template.provider_id,
        });
        Ok(template)
    }

    pub async fn delete_template(&self, id: Ulid) -> Result<(), BookingError> {
        let removed = self
            .stores
            .templates
            .modify(move |all| {
                let pos = all
                    .iter()
                    .position(|t| t.id == id)
                    .ok_or(BookingError::NotFound { kind: "template", id })?;
                Ok::<_, BookingError>(all.remove(pos))
            })
            .await?;
        self.events.publish(SlotEvent::AvailabilityChanged {
            provider_id: removed.provider_id,
        });
        Ok(())
    }

    // ── Appointments ─────────────────────────────────────────

    pub async fn list_appointments(
        &self,
        provider_id: Option<Ulid>,
    ) -> Result<Vec<Appointment>, BookingError> {
        Ok(self
            .stores
            .appointments
            .read(move |all| {
                all.iter()
                    .filter(|a| provider_id.is_none_or(|p| a.provider_id == p))
                    .cloned()
                    .collect()
            })
            .await?)
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.stores
            .appointments
            .get(id)
            .await?
            .ok_or(BookingError::NotFound {
                kind: "appointment",
                id,
            })
    }

    /// Book directly, bypassing the queue. The slot is marked Occupied.
    pub async fn create_appointment(&self, req: BookingRequest) -> Result<Appointment, BookingError> {
        let appointment = self.confirmer.create_appointment(&req).await?;
        let key = appointment.slot_key();
        self.slots.occupy(key);
        self.events.publish(SlotEvent::BookingOccupied {
            provider_id: key.provider_id,
            slot: key.start,
            appointment_id: appointment.id,
        });
        Ok(appointment)
    }

    /// Apply `patch`, re-checking overlaps against every other appointment
    /// of the provider.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, BookingError> {
        validate_notes(patch.notes.as_deref())?;
        let (before, after) = self
            .stores
            .appointments
            .modify(move |all| {
                let pos = all.iter().position(|a| a.id == id).ok_or(BookingError::NotFound {
                    kind: "appointment",
                    id,
                })?;
                let before = all[pos].clone();
                let mut after = before.clone();
                after.start = patch.start.unwrap_or(before.start);
                after.end = patch.end.unwrap_or(before.end);
                after.status = patch.status.unwrap_or(before.status);
                if patch.notes.is_some() {
                    after.notes = patch.notes;
                }
                validate_span(&after.span())?;
                if after.is_active() {
                    check_no_conflict(all, after.provider_id, &after.span(), Some(id))?;
                }
                after.updated_at = now_ms();
                all[pos] = after.clone();
                Ok::<_, BookingError>((before, after))
            })
            .await?;

        self.sync_slot(&before, &after);
        info!("appointment {id} updated");
        Ok(after)
    }

    /// Remove an appointment and free the slot it occupied.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), BookingError> {
        let removed = self
            .stores
            .appointments
            .modify(move |all| {
                let pos = all.iter().position(|a| a.id == id).ok_or(BookingError::NotFound {
                    kind: "appointment",
                    id,
                })?;
                Ok::<_, BookingError>(all.remove(pos))
            })
            .await?;
        if removed.status == AppointmentStatus::Confirmed {
            self.vacate(removed.slot_key(), "appointment deleted");
        }
        info!("appointment {id} deleted");
        Ok(())
    }

    /// Keep the registry in step with an edited appointment.
    fn sync_slot(&self, before: &Appointment, after: &Appointment) {
        let was_holding = before.status == AppointmentStatus::Confirmed;
        let holds = after.status == AppointmentStatus::Confirmed;
        if was_holding && (!holds || before.slot_key() != after.slot_key()) {
            self.vacate(before.slot_key(), "appointment moved or closed");
        }
        if holds && (!was_holding || before.slot_key() != after.slot_key()) {
            let key = after.slot_key();
            self.slots.occupy(key);
            self.events.publish(SlotEvent::BookingOccupied {
                provider_id: key.provider_id,
                slot: key.start,
                appointment_id: after.id,
            });
        }
    }

    fn vacate(&self, key: SlotKey, reason: &str) {
        if self.slots.vacate(key) {
            self.events.publish(SlotEvent::BookingAvailable {
                provider_id: key.provider_id,
                slot: key.start,
                reason: Some(reason.to_string()),
            });
        }
    }
}
