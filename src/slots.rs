use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::model::{Ms, SlotKey, SlotStatus};
use crate::observability::{SLOT_TRANSITIONS_TOTAL, SLOTS_TRACKED};

/// Outcome of a release request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Reserved → Available.
    Freed,
    /// The slot was already Available; nothing changed.
    AlreadyAvailable,
}

/// In-memory slot states. Unseen keys read as Available.
///
/// Each key is guarded by its DashMap shard lock, so `update` is an atomic
/// check-then-set per key. Nothing here is persisted.
pub struct SlotRegistry {
    slots: DashMap<SlotKey, SlotStatus>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub fn status(&self, key: &SlotKey) -> SlotStatus {
        self.slots.get(key).map(|s| *s).unwrap_or_default()
    }

    /// Unconditional overwrite.
    pub fn set_status(&self, key: SlotKey, status: SlotStatus) {
        self.slots.insert(key, status);
        record_transition(status);
        metrics::gauge!(SLOTS_TRACKED).set(self.slots.len() as f64);
    }

    /// Atomically decide the next state from the current one.
    ///
    /// `f` runs while the key is locked. Returns `Ok(next)` if `f` produced a
    /// new state (which is stored), `Err(current)` if it declined.
    pub fn update<F>(&self, key: SlotKey, f: F) -> Result<SlotStatus, SlotStatus>
    where
        F: FnOnce(SlotStatus) -> Option<SlotStatus>,
    {
        let result = match self.slots.entry(key) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                match f(current) {
                    Some(next) => {
                        entry.insert(next);
                        Ok(next)
                    }
                    None => Err(current),
                }
            }
            Entry::Vacant(entry) => match f(SlotStatus::Available) {
                Some(next) => {
                    entry.insert(next);
                    Ok(next)
                }
                None => Err(SlotStatus::Available),
            },
        };
        if let Ok(next) = result {
            record_transition(next);
            metrics::gauge!(SLOTS_TRACKED).set(self.slots.len() as f64);
        }
        result
    }

    /// Available → Reserved. Any other state is returned as the error.
    pub fn reserve(&self, key: SlotKey) -> Result<(), SlotStatus> {
        self.update(key, |current| {
            (current == SlotStatus::Available).then_some(SlotStatus::Reserved)
        })
        .map(|_| ())
    }

    /// Reserved → Available. Releasing an Available slot is a no-op success;
    /// releasing an Occupied one fails.
    pub fn release(&self, key: SlotKey) -> Result<Released, SlotStatus> {
        match self.update(key, |current| {
            (current == SlotStatus::Reserved).then_some(SlotStatus::Available)
        }) {
            Ok(_) => Ok(Released::Freed),
            Err(SlotStatus::Available) => Ok(Released::AlreadyAvailable),
            Err(other) => Err(other),
        }
    }

    /// Mark a slot as held by a pending booking and return the state it had.
    /// Occupied slots are always refused; with `strict` Reserved slots are
    /// refused too.
    pub fn hold_for_booking(&self, key: SlotKey, strict: bool) -> Result<SlotStatus, SlotStatus> {
        let mut previous = SlotStatus::Available;
        self.update(key, |current| {
            previous = current;
            match current {
                SlotStatus::Available => Some(SlotStatus::Reserved),
                SlotStatus::Reserved if !strict => Some(SlotStatus::Reserved),
                _ => None,
            }
        })
        .map(|_| previous)
    }

    pub fn occupy(&self, key: SlotKey) {
        self.set_status(key, SlotStatus::Occupied);
    }

    /// Reserved → Available after a failed confirmation. Returns false and
    /// leaves the slot alone if it is no longer Reserved.
    pub fn rollback(&self, key: SlotKey) -> bool {
        self.update(key, |current| {
            (current == SlotStatus::Reserved).then_some(SlotStatus::Available)
        })
        .is_ok()
    }

    /// Occupied → Available once the appointment holding the slot is gone.
    pub fn vacate(&self, key: SlotKey) -> bool {
        self.update(key, |current| {
            (current == SlotStatus::Occupied).then_some(SlotStatus::Available)
        })
        .is_ok()
    }

    /// Drop states for slots that started before `cutoff`. Reserved slots
    /// stay because a confirmation may still be queued for them.
    pub fn evict_before(&self, cutoff: Ms) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|key, status| key.start >= cutoff || *status == SlotStatus::Reserved);
        let evicted = before.saturating_sub(self.slots.len());
        metrics::gauge!(SLOTS_TRACKED).set(self.slots.len() as f64);
        evicted
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn record_transition(to: SlotStatus) {
    metrics::counter!(SLOT_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
}
