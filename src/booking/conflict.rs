use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::BookingError;

pub(crate) fn validate_span(span: &Span) -> Result<(), BookingError> {
    if span.is_empty() {
        return Err(BookingError::Validation(format!(
            "start ({}) must be before end ({})",
            span.start, span.end
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(BookingError::Validation("timestamp out of range".into()));
    }
    if span.duration_ms() > MAX_APPOINTMENT_DURATION_MS {
        return Err(BookingError::Validation("appointment too long".into()));
    }
    Ok(())
}

pub(crate) fn validate_notes(notes: Option<&str>) -> Result<(), BookingError> {
    match notes {
        Some(n) if n.len() > MAX_NOTES_LEN => {
            Err(BookingError::Validation("notes too long".into()))
        }
        _ => Ok(()),
    }
}

/// First active appointment of `provider_id` overlapping `span`, skipping
/// `ignore` (the appointment being edited, if any).
pub(crate) fn find_conflict<'a>(
    appointments: &'a [Appointment],
    provider_id: Ulid,
    span: &Span,
    ignore: Option<Ulid>,
) -> Option<&'a Appointment> {
    appointments.iter().find(|a| {
        a.provider_id == provider_id
            && a.is_active()
            && Some(a.id) != ignore
            && a.span().overlaps(span)
    })
}

pub(crate) fn check_no_conflict(
    appointments: &[Appointment],
    provider_id: Ulid,
    span: &Span,
    ignore: Option<Ulid>,
) -> Result<(), BookingError> {
    match find_conflict(appointments, provider_id, span, ignore) {
        Some(existing) => Err(BookingError::Conflict(existing.id)),
        None => Ok(()),
    }
}
