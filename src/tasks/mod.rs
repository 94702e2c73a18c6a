mod queue;

pub use queue::TaskQueue;

use async_trait::async_trait;
use ulid::Ulid;

use crate::booking::BookingError;
use crate::model::{BookingRequest, Ms, ReportFilter, now_ms};
use crate::store::StoreError;

/// Deferred work consumed exactly once by the worker. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: Ulid,
    pub payload: TaskPayload,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    Backup { reason: String },
    GenerateReport(ReportFilter),
    ConfirmBooking(BookingRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Backup,
    GenerateReport,
    ConfirmBooking,
}

impl Task {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: Ulid::new(),
            payload,
            created_at: now_ms(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self.payload {
            TaskPayload::Backup { .. } => TaskKind::Backup,
            TaskPayload::GenerateReport(_) => TaskKind::GenerateReport,
            TaskPayload::ConfirmBooking(_) => TaskKind::ConfirmBooking,
        }
    }
}

#[derive(Debug)]
pub enum TaskError {
    Booking(BookingError),
    Store(StoreError),
    Io(std::io::Error),
    /// The queue's worker has exited; nothing will consume new tasks.
    QueueClosed,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Booking(e) => write!(f, "{e}"),
            TaskError::Store(e) => write!(f, "{e}"),
            TaskError::Io(e) => write!(f, "I/O error: {e}"),
            TaskError::QueueClosed => write!(f, "task queue is closed"),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<BookingError> for TaskError {
    fn from(e: BookingError) -> Self {
        TaskError::Booking(e)
    }
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        TaskError::Store(e)
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Io(e)
    }
}

/// Runs one task to completion. The worker awaits each call before
/// dequeuing the next task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<(), TaskError>;

    /// Called by the worker when `handle` panicked on `task`, so state the
    /// task left half-done can be undone.
    fn abandoned(&self, _task: &Task, _reason: &str) {}
}
