//! Device-local key-value persistence.
//!
//! Defines the [`KeyValueStore`] trait the cache is written through: opaque
//! get/set/remove by string key. Two implementations live here:
//! - [`InMemoryKv`]: non-persistent store for tests and the demo session
//! - [`FileKv`]: one file per key under a directory, survives restarts

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

/// Errors that can occur during key-value storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage is full or unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),
}

/// Trait for the device-local string key-value store.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Store `value` under `key`, replacing any previous value.
    fn set(
        &self,
        key: &str,
        value: String,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// List every stored key.
    fn keys(&self) -> impl std::future::Future<Output = Result<Vec<String>, StoreError>> + Send;
}

/// In-memory implementation of [`KeyValueStore`].
///
/// All data is lost when the process exits.
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryKv {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

/// File-backed implementation of [`KeyValueStore`].
///
/// Each key maps to `<dir>/<encoded key>.json`. Keys are encoded so that
/// any string is a safe file name and the mapping is reversible. Writes go
/// to a temporary sibling first and are renamed into place, so a crash
/// mid-write leaves the previous value intact.
pub struct FileKv {
    dir: PathBuf,
}

const FILE_EXTENSION: &str = "json";

impl FileKv {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("{}: {e}", dir.display()))
            })?;
        Ok(Self { dir })
    }

    /// Directory this store writes into.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{FILE_EXTENSION}", encode_key(key)))
    }
}

impl KeyValueStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::ReadFailed(format!("{key}: {e}"))),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("{key}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("{key}: {e}")))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::WriteFailed(format!("{key}: {e}"))),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| {
                StoreError::ReadFailed(format!("{}: {e}", self.dir.display()))
            })?;
        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StoreError::ReadFailed(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_key)
            {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Escape every byte outside `[A-Za-z0-9_-]` as `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
