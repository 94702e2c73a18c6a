//! Whole-collection persistence.
//!
//! A collection is the full ordered list of one record type, read and
//! written as a unit. Every operation, including read-modify-write ones,
//! runs inside a single `Backend::transact` call so it holds the collection
//! lock from the read through the write.

mod file;
mod lock;
mod memory;

pub use file::FileCollection;
pub use memory::MemoryCollection;

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use ulid::Ulid;

use crate::model::{Appointment, AvailabilityTemplate, Provider, Subject};

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Encode(String),
    /// The blocking store task panicked or was cancelled.
    Task(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "store I/O error: {e}"),
            StoreError::Encode(e) => write!(f, "store encode error: {e}"),
            StoreError::Task(e) => write!(f, "store task failed: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// A persistable entity with a stable id.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> Ulid;
}

impl Record for Appointment {
    fn id(&self) -> Ulid {
        self.id
    }
}

impl Record for Provider {
    fn id(&self) -> Ulid {
        self.id
    }
}

impl Record for Subject {
    fn id(&self) -> Ulid {
        self.id
    }
}

impl Record for AvailabilityTemplate {
    fn id(&self) -> Ulid {
        self.id
    }
}

/// Storage for one collection. Implementations are blocking.
pub trait Backend<T>: Send + Sync {
    /// Load the collection, hand it to `f` and write it back if `f` returns
    /// true, all under the collection lock.
    fn transact(&self, f: &mut dyn FnMut(&mut Vec<T>) -> bool) -> Result<(), StoreError>;

    /// Write a consistent copy of the collection to `dest`.
    fn export(&self, dest: &Path) -> Result<(), StoreError>;
}

/// Async handle to a collection. Blocking work runs on the blocking pool.
pub struct Repository<T> {
    name: &'static str,
    backend: Arc<dyn Backend<T>>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            backend: self.backend.clone(),
        }
    }
}

impl<T: Record> Repository<T> {
    pub fn new(name: &'static str, backend: Arc<dyn Backend<T>>) -> Self {
        Self { name, backend }
    }

    /// Repository over `<dir>/<name>.bin`, creating the file if missing.
    pub fn open_file(dir: &Path, name: &'static str) -> Result<Self, StoreError> {
        let backend = FileCollection::<T>::open(dir.join(format!("{name}.bin")), name)?;
        Ok(Self::new(name, Arc::new(backend)))
    }

    pub fn in_memory(name: &'static str) -> Self {
        Self::new(name, Arc::new(MemoryCollection::<T>::new()))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn list_all(&self) -> Result<Vec<T>, StoreError> {
        self.read(|records| records.to_vec()).await
    }

    pub async fn get(&self, id: Ulid) -> Result<Option<T>, StoreError> {
        self.read(move |records| records.iter().find(|r| r.id() == id).cloned())
            .await
    }

    /// Replace the whole collection.
    pub async fn save_all(&self, new_records: Vec<T>) -> Result<(), StoreError> {
        self.modify(move |records| {
            *records = new_records;
            Ok::<_, StoreError>(())
        })
        .await
    }

    /// Insert or replace by id. A replaced record moves to the end.
    pub async fn save(&self, record: T) -> Result<(), StoreError> {
        self.modify(move |records| {
            let id = record.id();
            records.retain(|r| r.id() != id);
            records.push(record);
            Ok::<_, StoreError>(())
        })
        .await
    }

    /// Remove by id. Returns false (and writes nothing) if the id is absent.
    pub async fn delete(&self, id: Ulid) -> Result<bool, StoreError> {
        let backend = self.backend.clone();
        run_blocking(move || {
            let mut removed = false;
            backend.transact(&mut |records: &mut Vec<T>| {
                let before = records.len();
                records.retain(|r| r.id() != id);
                removed = records.len() != before;
                removed
            })?;
            Ok(removed)
        })
        .await
    }

    /// Read-only access under the lock. Nothing is written.
    pub async fn read<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[T]) -> R + Send + 'static,
        R: Send + 'static,
    {
        let backend = self.backend.clone();
        run_blocking(move || {
            let mut f = Some(f);
            let mut out = None;
            backend.transact(&mut |records: &mut Vec<T>| {
                if let Some(f) = f.take() {
                    out = Some(f(records.as_slice()));
                }
                false
            })?;
            out.ok_or_else(|| StoreError::Task("read closure was not run".into()))
        })
        .await
    }

    /// Read-modify-write under one lock acquisition. `f` sees the current
    /// records; if it returns `Ok` the (possibly changed) collection is
    /// written back, if it returns `Err` nothing is written.
    pub async fn modify<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Vec<T>) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let backend = self.backend.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut f = Some(f);
            let mut out = None;
            let stored = backend.transact(&mut |records: &mut Vec<T>| {
                let Some(f) = f.take() else { return false };
                let result = f(records);
                let write = result.is_ok();
                out = Some(result);
                write
            });
            (stored, out)
        })
        .await;
        match joined {
            Ok((Ok(()), Some(Ok(value)))) => Ok(value),
            Ok((Ok(()), Some(Err(e)))) => Err(e),
            Ok((Ok(()), None)) => Err(StoreError::Task("modify closure was not run".into()).into()),
            Ok((Err(e), _)) => Err(e.into()),
            Err(e) => Err(StoreError::Task(e.to_string()).into()),
        }
    }

    /// Copy the collection to `dest` under its lock.
    pub async fn export(&self, dest: &Path) -> Result<(), StoreError> {
        let backend = self.backend.clone();
        let dest = dest.to_path_buf();
        run_blocking(move || backend.export(&dest)).await
    }
}

async fn run_blocking<R, F>(f: F) -> Result<R, StoreError>
where
    F: FnOnce() -> Result<R, StoreError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// The four collections the service persists.
#[derive(Clone)]
pub struct Stores {
    pub providers: Repository<Provider>,
    pub subjects: Repository<Subject>,
    pub templates: Repository<AvailabilityTemplate>,
    pub appointments: Repository<Appointment>,
}

impl Stores {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            providers: Repository::open_file(dir, "providers")?,
            subjects: Repository::open_file(dir, "subjects")?,
            templates: Repository::open_file(dir, "templates")?,
            appointments: Repository::open_file(dir, "appointments")?,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            providers: Repository::in_memory("providers"),
            subjects: Repository::in_memory("subjects"),
            templates: Repository::in_memory("templates"),
            appointments: Repository::in_memory("appointments"),
        }
    }
}
