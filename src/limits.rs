use crate::model::{DAY_MS, Ms};

/// Earliest accepted timestamp (the epoch).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Latest accepted timestamp (9999-12-31T23:59:59.999Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Longest single appointment.
pub const MAX_APPOINTMENT_DURATION_MS: Ms = DAY_MS;

pub const MAX_NOTES_LEN: usize = 2_000;

pub const MAX_NAME_LEN: usize = 200;

/// Longest window a slot query may cover.
pub const MAX_QUERY_DAYS: u32 = 62;

pub const MAX_PROVIDERS_PER_QUERY: usize = 100;

/// Upper bound on slots a single template can yield per day.
pub const MAX_SLOTS_PER_TEMPLATE: usize = 288;

/// Minutes in a day; template bounds are checked against this.
pub const MINUTES_PER_DAY: u32 = 1_440;
