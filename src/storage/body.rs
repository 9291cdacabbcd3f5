//! Content-addressed storage for fetched page bodies
//!
//! Bodies are keyed by the page's full hash, so identical content is stored
//! once. Writes are best-effort: callers log failures and carry on.

use crate::storage::{StorageError, StorageResult};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Document store for raw page bodies
pub trait BodyStore: Send + Sync {
    /// Stores `body` under `hash`; storing an existing hash is a no-op
    fn put(&self, hash: &str, body: &[u8]) -> StorageResult<()>;

    fn get(&self, hash: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Deletes the body stored under `hash`
    ///
    /// # Returns
    ///
    /// `false` when nothing was stored
    fn remove(&self, hash: &str) -> StorageResult<bool>;
}

/// Stores bodies as files under `root/<first two hex chars>/<hash>`
pub struct FsBodyStore {
    root: PathBuf,
}

impl FsBodyStore {
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, hash: &str) -> StorageResult<PathBuf> {
        if hash.len() < 3 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::Serialization(format!(
                "invalid content hash '{}'",
                hash
            )));
        }
        Ok(self.root.join(&hash[..2]).join(hash))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BodyStore for FsBodyStore {
    fn put(&self, hash: &str, body: &[u8]) -> StorageResult<()> {
        let path = self.path_for(hash)?;
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Readers never observe a partially written body
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(body)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, hash: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(hash)?;
        match fs::read(&path) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, hash: &str) -> StorageResult<bool> {
        let path = self.path_for(hash)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory body store
#[derive(Default)]
pub struct MemoryBodyStore {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBodyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bodies.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BodyStore for MemoryBodyStore {
    fn put(&self, hash: &str, body: &[u8]) -> StorageResult<()> {
        let mut bodies = self.bodies.lock().map_err(|_| StorageError::LockPoisoned)?;
        bodies
            .entry(hash.to_string())
            .or_insert_with(|| body.to_vec());
        Ok(())
    }

    fn get(&self, hash: &str) -> StorageResult<Option<Vec<u8>>> {
        let bodies = self.bodies.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(bodies.get(hash).cloned())
    }

    fn remove(&self, hash: &str) -> StorageResult<bool> {
        let mut bodies = self.bodies.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(bodies.remove(hash).is_some())
    }
}
