use std::path::Path;
use std::sync::{Mutex, PoisonError};

use super::file::encode_for_export;
use super::{Backend, Record, StoreError};

/// Collection held in memory. Same transaction semantics as the file
/// backend: `f` works on a copy and the copy replaces the original only
/// when `f` asks for a write.
pub struct MemoryCollection<T> {
    records: Mutex<Vec<T>>,
}

impl<T> MemoryCollection<T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Default for MemoryCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> Backend<T> for MemoryCollection<T> {
    fn transact(&self, f: &mut dyn FnMut(&mut Vec<T>) -> bool) -> Result<(), StoreError> {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut working = guard.clone();
        if f(&mut working) {
            *guard = working;
        }
        Ok(())
    }

    fn export(&self, dest: &Path) -> Result<(), StoreError> {
        let guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        std::fs::write(dest, encode_for_export(guard.as_slice())?)?;
        Ok(())
    }
}
