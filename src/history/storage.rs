//! Durable keyed storage for serialized turn sequences.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Keyed byte storage. Keys are already sanitized chat ids.
#[async_trait]
pub trait TurnStorage: Send + Sync {
    /// Stored bytes for `key`, or `None` when nothing was ever written.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Replace every character outside `[a-zA-Z0-9_.-]` with `_`.
pub fn sanitize_chat_id(chat_id: &str) -> String {
    chat_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One `<key>.json` file per chat under a directory.
pub struct FileTurnStorage {
    dir: PathBuf,
}

impl FileTurnStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl TurnStorage for FileTurnStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading history file {}", path.display())),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating history directory {}", self.dir.display()))?;

        // Write to a sibling temp file first so a crash never leaves a half-written record.
        let path = self.path_for(key);
        let temp = self.dir.join(format!(".{key}.json.tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&temp, bytes)
            .await
            .with_context(|| format!("writing history file {}", temp.display()))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e).with_context(|| format!("replacing history file {}", path.display()));
        }
        Ok(())
    }
}

/// In-process storage, used by tests and by embedders that do not need durability.
#[derive(Default)]
pub struct MemoryTurnStorage {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryTurnStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl TurnStorage for MemoryTurnStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.records.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}
