//! Memory snapshot persistence.
//!
//! Snapshots are written atomically (temp file then rename) so a crash never
//! leaves a half-written file behind. Failures are reported to the caller,
//! which logs them; persistence never blocks request handling.

use crate::error::MemoryError;
use crate::memory::MemorySnapshot;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Atomically write JSON data to a file, creating parent directories.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)
}

/// Load JSON from a file. `Ok(None)` if the file does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Storage for per-user memory snapshots.
#[async_trait]
pub trait MemoryPersistence: Send + Sync {
    async fn save(&self, user_id: &str, snapshot: &MemorySnapshot) -> Result<(), MemoryError>;

    async fn load(&self, user_id: &str) -> Result<Option<MemorySnapshot>, MemoryError>;
}

/// One JSON file per user under a directory.
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_user_id(user_id)))
    }
}

/// File-name-safe, collision-free encoding of a user id.
fn encode_user_id(user_id: &str) -> String {
    let mut out = String::with_capacity(user_id.len());
    for byte in user_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}

#[async_trait]
impl MemoryPersistence for JsonFilePersistence {
    async fn save(&self, user_id: &str, snapshot: &MemorySnapshot) -> Result<(), MemoryError> {
        let path = self.path_for(user_id);
        let snapshot = snapshot.clone();
        let revision = snapshot.revision();
        tokio::task::spawn_blocking(move || atomic_write_json(&path, &snapshot))
            .await
            .map_err(|e| MemoryError::PersistenceError {
                message: format!("persistence task failed: {}", e),
            })?
            .map_err(|e| MemoryError::PersistenceError {
                message: e.to_string(),
            })?;
        debug!(user_id, revision, "Memory snapshot saved");
        Ok(())
    }

    async fn load(&self, user_id: &str) -> Result<Option<MemorySnapshot>, MemoryError> {
        let path = self.path_for(user_id);
        tokio::task::spawn_blocking(move || load_json::<MemorySnapshot>(&path))
            .await
            .map_err(|e| MemoryError::LoadFailed {
                user_id: user_id.to_string(),
                message: e.to_string(),
            })?
            .map_err(|e| MemoryError::LoadFailed {
                user_id: user_id.to_string(),
                message: e.to_string(),
            })
    }
}

/// Keeps snapshots in process memory.
#[derive(Default)]
pub struct InMemoryPersistence {
    snapshots: RwLock<HashMap<String, MemorySnapshot>>,
    saves: AtomicUsize,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn get(&self, user_id: &str) -> Option<MemorySnapshot> {
        self.snapshots.read().await.get(user_id).cloned()
    }
}

#[async_trait]
impl MemoryPersistence for InMemoryPersistence {
    async fn save(&self, user_id: &str, snapshot: &MemorySnapshot) -> Result<(), MemoryError> {
        self.snapshots
            .write()
            .await
            .insert(user_id.to_string(), snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, user_id: &str) -> Result<Option<MemorySnapshot>, MemoryError> {
        Ok(self.get(user_id).await)
    }
}
