//! The persistence boundary for interaction records.
//!
//! Retrieval, expiry and encryption of records belong to whatever sits behind
//! [InteractionStorage]. The two implementations here exist so the daemon can
//! run standalone: one keeps records in memory, the other appends them to a
//! json-lines file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;

#[async_trait]
pub trait InteractionStorage: Send + Sync {
    /// Store a record against the correlation key of a probe.
    async fn add_interaction(&self, correlation_key: &str, data: &[u8])
        -> Result<(), StorageError>;

    /// Store a record against the server's own token.
    async fn add_interaction_with_id(&self, token: &str, data: &[u8]) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<BTreeMap<String, Vec<Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records stored under `key`, oldest first.
    pub fn get(&self, key: &str) -> Vec<Vec<u8>> {
        match self.inner.lock() {
            Ok(guard) => guard.get(key).cloned().unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned().unwrap_or_default(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }

    /// Total number of records across all keys.
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.values().map(Vec::len).sum(),
            Err(poisoned) => poisoned.into_inner().values().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".to_string()))?;
        guard.entry(key.to_string()).or_default().push(data.to_vec());
        Ok(())
    }
}

#[async_trait]
impl InteractionStorage for MemoryStorage {
    async fn add_interaction(
        &self,
        correlation_key: &str,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.append(correlation_key, data)
    }

    async fn add_interaction_with_id(&self, token: &str, data: &[u8]) -> Result<(), StorageError> {
        self.append(token, data)
    }
}

#[derive(Serialize)]
struct FileEntry<'a> {
    key: &'a str,
    interaction: &'a serde_json::value::RawValue,
}

/// Appends one json object per line: `{"key": .., "interaction": ..}`.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl FileStorage {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        Ok(FileStorage {
            path: path.as_ref().to_path_buf(),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    async fn append(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let raw = std::str::from_utf8(data)
            .map_err(|e| StorageError::Unavailable(format!("record is not utf-8: {e}")))?;
        let interaction = serde_json::value::RawValue::from_string(raw.trim_end().to_string())?;
        let mut line = serde_json::to_vec(&FileEntry {
            key,
            interaction: &*interaction,
        })?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl InteractionStorage for FileStorage {
    async fn add_interaction(
        &self,
        correlation_key: &str,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.append(correlation_key, data).await
    }

    async fn add_interaction_with_id(&self, token: &str, data: &[u8]) -> Result<(), StorageError> {
        self.append(token, data).await
    }
}
