//! Message payload storage.
//!
//! Payloads are written when an order is created, read by whoever fetches
//! a transmitted message, and deleted when the order is cancelled or
//! expired, or when its retention window runs out. Deleting a payload that
//! is already gone is not an error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use uuid::Uuid;

pub trait PayloadStore: Send + Sync {
    fn write(&self, uuid: &Uuid, message: &[u8]) -> io::Result<()>;

    /// `None` once deleted.
    fn read(&self, uuid: &Uuid) -> io::Result<Option<Vec<u8>>>;

    /// Returns whether a payload was actually removed.
    fn delete(&self, uuid: &Uuid) -> io::Result<bool>;
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// One file per order, named by uuid, in a flat directory.
#[derive(Debug, Clone)]
pub struct FsPayloadStore {
    dir: PathBuf,
}

impl FsPayloadStore {
    /// Create the directory if needed.
    pub fn open<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, uuid: &Uuid) -> PathBuf {
        self.dir.join(uuid.to_string())
    }
}

impl PayloadStore for FsPayloadStore {
    fn write(&self, uuid: &Uuid, message: &[u8]) -> io::Result<()> {
        fs::write(self.path_for(uuid), message)
    }

    fn read(&self, uuid: &Uuid) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(uuid)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, uuid: &Uuid) -> io::Result<bool> {
        match fs::remove_file(self.path_for(uuid)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Payloads in a map. Used by tests and by nodes run without a data dir.
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    payloads: DashMap<Uuid, Vec<u8>>,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.payloads.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn write(&self, uuid: &Uuid, message: &[u8]) -> io::Result<()> {
        self.payloads.insert(*uuid, message.to_vec());
        Ok(())
    }

    fn read(&self, uuid: &Uuid) -> io::Result<Option<Vec<u8>>> {
        Ok(self.payloads.get(uuid).map(|entry| entry.value().clone()))
    }

    fn delete(&self, uuid: &Uuid) -> io::Result<bool> {
        Ok(self.payloads.remove(uuid).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn PayloadStore) {
        let uuid = Uuid::new_v4();
        assert_eq!(store.read(&uuid).unwrap(), None);
        store.write(&uuid, b"hello sky").unwrap();
        assert_eq!(store.read(&uuid).unwrap().as_deref(), Some(&b"hello sky"[..]));
        assert!(store.delete(&uuid).unwrap());
        assert!(!store.delete(&uuid).unwrap());
        assert_eq!(store.read(&uuid).unwrap(), None);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryPayloadStore::new());
    }

    #[test]
    fn test_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPayloadStore::open(dir.path().join("messages")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_fs_store_file_named_by_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPayloadStore::open(dir.path()).unwrap();
        let uuid = Uuid::new_v4();
        store.write(&uuid, b"x").unwrap();
        assert!(dir.path().join(uuid.to_string()).exists());
    }
}
