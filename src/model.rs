use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Midnight (UTC) of the day containing `t`.
pub fn day_start(t: Ms) -> Ms {
    t - t.rem_euclid(DAY_MS)
}

/// Day of week for `t`, 0 = Monday .. 6 = Sunday. The epoch fell on a Thursday.
pub fn weekday(t: Ms) -> u8 {
    (t.div_euclid(DAY_MS) + 3).rem_euclid(7) as u8
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Slots ────────────────────────────────────────────────────────

/// Identity of a bookable slot: a provider plus the slot's start instant.
///
/// Rendered as `"{provider_id}:{start}"`, which is also what `FromStr` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub provider_id: Ulid,
    pub start: Ms,
}

impl SlotKey {
    pub fn new(provider_id: Ulid, start: Ms) -> Self {
        Self { provider_id, start }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider_id, self.start)
    }
}

impl FromStr for SlotKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, start) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid slot key: {s}"))?;
        let provider_id =
            Ulid::from_string(provider).map_err(|e| format!("invalid provider id: {e}"))?;
        let start = start
            .parse::<Ms>()
            .map_err(|e| format!("invalid slot start: {e}"))?;
        Ok(Self { provider_id, start })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    #[default]
    Available,
    Reserved,
    Occupied,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Reserved => "reserved",
            SlotStatus::Occupied => "occupied",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Stored records ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    #[default]
    Confirmed,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub subject_id: Ulid,
    pub provider_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Appointment {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    /// Cancelled appointments no longer hold their time range.
    pub fn is_active(&self) -> bool {
        self.status != AppointmentStatus::Cancelled
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.provider_id, self.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Ulid,
    pub name: String,
    pub specialty: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: Ulid,
    pub name: String,
    /// External identity document (national id, record number).
    pub document: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Weekly recurring availability of a provider.
///
/// Minutes are minutes-of-day in UTC. Without `slot_minutes` the template
/// yields a single slot at `start_minute`; with it, back-to-back slots of
/// that length covering `[start_minute, end_minute)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityTemplate {
    pub id: Ulid,
    pub provider_id: Ulid,
    /// 0 = Monday .. 6 = Sunday.
    pub weekday: u8,
    pub start_minute: u32,
    pub end_minute: u32,
    pub slot_minutes: Option<u32>,
}

// ── Requests carried through the task queue ──────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub subject_id: Ulid,
    pub provider_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    #[serde(default)]
    pub notes: Option<String>,
}

impl BookingRequest {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.provider_id, self.start)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFilter {
    #[serde(default)]
    pub provider_id: Option<Ulid>,
    #[serde(default)]
    pub from: Option<Ms>,
    #[serde(default)]
    pub to: Option<Ms>,
}

// ── Events ───────────────────────────────────────────────────────

/// Messages fanned out to event-stream subscribers, serialized as `{type, data}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SlotEvent {
    BookingReserved {
        provider_id: Ulid,
        slot: Ms,
    },
    BookingReleased {
        provider_id: Ulid,
        slot: Ms,
    },
    BookingOccupied {
        provider_id: Ulid,
        slot: Ms,
        appointment_id: Ulid,
    },
    BookingAvailable {
        provider_id: Ulid,
        slot: Ms,
        reason: Option<String>,
    },
    AvailabilityChanged {
        provider_id: Ulid,
    },
    ReportReady {
        file: String,
    },
    BackupCompleted {
        dir: String,
        reason: String,
    },
}

impl SlotEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SlotEvent::BookingReserved { .. } => "booking-reserved",
            SlotEvent::BookingReleased { .. } => "booking-released",
            SlotEvent::BookingOccupied { .. } => "booking-occupied",
            SlotEvent::BookingAvailable { .. } => "booking-available",
            SlotEvent::AvailabilityChanged { .. } => "availability-changed",
            SlotEvent::ReportReady { .. } => "report-ready",
            SlotEvent::BackupCompleted { .. } => "backup-completed",
        }
    }
}
