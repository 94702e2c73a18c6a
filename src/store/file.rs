use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use super::lock::CollectionLock;
use super::{Backend, Record, StoreError};

/// Encode a whole collection to `[u32 len][bincode Vec<T>][u32 crc32]`.
fn encode_collection<T: Record>(records: &[T]) -> Result<Vec<u8>, StoreError> {
    let payload = bincode::serialize(records).map_err(|e| StoreError::Encode(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Encode("collection exceeds 4 GiB".into()))?;
    let crc = crc32fast::hash(&payload);
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decode a container. `None` means the bytes are not a valid collection:
/// short read, length mismatch, CRC mismatch or undecodable payload.
fn decode_collection<T: Record>(bytes: &[u8]) -> Option<Vec<T>> {
    let len_bytes: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if bytes.len() != len.checked_add(8)? {
        return None;
    }
    let payload = &bytes[4..4 + len];
    let crc_bytes: [u8; 4] = bytes[4 + len..].try_into().ok()?;
    if u32::from_le_bytes(crc_bytes) != crc32fast::hash(payload) {
        return None;
    }
    bincode::deserialize::<Vec<T>>(payload).ok()
}

/// Write bytes to a temp sibling, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("bin.tmp");
    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&tmp_path, path)
}

/// A collection persisted as a single file.
///
/// A file that cannot be read back (missing bytes, checksum mismatch,
/// undecodable payload) is replaced by an empty collection. The reset is
/// logged and counted, never returned to the caller.
pub struct FileCollection<T> {
    path: PathBuf,
    name: &'static str,
    lock: CollectionLock,
    resets: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> FileCollection<T> {
    /// Open (or create) the collection file at `path`.
    pub fn open(path: PathBuf, name: &'static str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = CollectionLock::new(path.with_extension("lock"));
        let collection = Self {
            path,
            name,
            lock,
            resets: AtomicU64::new(0),
            _marker: PhantomData,
        };
        {
            let _guard = collection.lock.acquire()?;
            if !collection.path.exists() {
                write_atomic(&collection.path, &encode_collection::<T>(&[])?)?;
            }
        }
        Ok(collection)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How many times a corrupt file was replaced since `open`.
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Read the collection. Caller holds the lock.
    fn load(&self) -> Result<Vec<T>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Removed behind our back: recreate it, nothing was lost
                self.write(&[])?;
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!("collection {} unreadable ({e}), resetting", self.name);
                return self.reset();
            }
        };
        match decode_collection(&bytes) {
            Some(records) => Ok(records),
            None => {
                warn!(
                    "collection {} is corrupt ({} bytes), resetting to empty",
                    self.name,
                    bytes.len()
                );
                self.reset()
            }
        }
    }

    fn reset(&self) -> Result<Vec<T>, StoreError> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(crate::observability::STORE_RESETS_TOTAL, "collection" => self.name)
            .increment(1);
        self.write(&[])?;
        Ok(Vec::new())
    }

    /// Write the collection. Caller holds the lock.
    fn write(&self, records: &[T]) -> Result<(), StoreError> {
        let start = std::time::Instant::now();
        let bytes = encode_collection(records)?;
        write_atomic(&self.path, &bytes)?;
        metrics::histogram!(crate::observability::STORE_WRITE_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        Ok(())
    }
}

impl<T: Record> Backend<T> for FileCollection<T> {
    fn transact(&self, f: &mut dyn FnMut(&mut Vec<T>) -> bool) -> Result<(), StoreError> {
        let _guard = self.lock.acquire()?;
        let mut records = self.load()?;
        if f(&mut records) {
            self.write(&records)?;
        }
        Ok(())
    }

    fn export(&self, dest: &Path) -> Result<(), StoreError> {
        let _guard = self.lock.acquire()?;
        // Re-encode rather than copy so a corrupt file is exported as its reset form.
        let records = self.load()?;
        write_atomic(dest, &encode_collection(&records)?)?;
        Ok(())
    }
}

pub(super) fn encode_for_export<T: Record>(records: &[T]) -> Result<Vec<u8>, StoreError> {
    encode_collection(records)
}
