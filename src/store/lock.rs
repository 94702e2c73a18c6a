use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(unix)]
use fs2::FileExt;

/// Exclusive access to one collection file.
///
/// Always takes an in-process mutex. On unix it additionally holds an
/// advisory `flock` on a sibling `.lock` file so separate processes sharing
/// the data directory serialize too. Other platforms get the in-process
/// mutex only and are not safe across processes.
pub struct CollectionLock {
    inner: Mutex<()>,
    #[cfg_attr(not(unix), allow(dead_code))]
    lock_path: PathBuf,
}

/// Held for the duration of one read-modify-write. Dropping it releases
/// the advisory lock before the mutex.
pub struct CollectionGuard<'a> {
    #[cfg(unix)]
    file: std::fs::File,
    _inner: MutexGuard<'a, ()>,
}

impl CollectionLock {
    pub fn new(lock_path: PathBuf) -> Self {
        Self {
            inner: Mutex::new(()),
            lock_path,
        }
    }

    /// Block until both locks are held.
    pub fn acquire(&self) -> io::Result<CollectionGuard<'_>> {
        // A panic inside a previous critical section leaves no partial
        // state behind (writes are tmp + rename), so poisoning is ignored.
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        #[cfg(unix)]
        {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&self.lock_path)?;
            file.lock_exclusive()?;
            Ok(CollectionGuard {
                file,
                _inner: inner,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(CollectionGuard { _inner: inner })
        }
    }
}

#[cfg(unix)]
impl Drop for CollectionGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("failed to release collection lock: {e}");
        }
    }
}
