use ulid::Ulid;

use crate::model::{SlotKey, SlotStatus};
use crate::store::StoreError;

#[derive(Debug)]
pub enum BookingError {
    /// Malformed input: bad span, out-of-range timestamp, oversized field.
    Validation(String),
    /// The request names an entity that does not exist.
    UnknownReference { kind: &'static str, id: Ulid },
    /// Direct lookup of an entity that does not exist.
    NotFound { kind: &'static str, id: Ulid },
    /// Overlaps an existing appointment of the same provider.
    Conflict(Ulid),
    /// The slot's current state forbids the operation.
    SlotUnavailable { slot: SlotKey, status: SlotStatus },
    Store(StoreError),
    QueueClosed,
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::Validation(msg) => write!(f, "invalid request: {msg}"),
            BookingError::UnknownReference { kind, id } => write!(f, "unknown {kind}: {id}"),
            BookingError::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            BookingError::Conflict(id) => write!(f, "conflict with appointment: {id}"),
            BookingError::SlotUnavailable { slot, status } => {
                write!(f, "slot {slot} is {status}")
            }
            BookingError::Store(e) => write!(f, "{e}"),
            BookingError::QueueClosed => write!(f, "task queue is closed"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        BookingError::Store(e)
    }
}
