//! Per-chat conversation history, trimmed to a fixed window of turns.
//!
//! [`HistoryStore`] owns every conversation. Appends to the same chat are
//! serialized through a per-chat async lock so rapid consecutive messages never
//! lose a turn, while different chats persist without waiting on each other.

pub mod storage;

pub use storage::{FileTurnStorage, MemoryTurnStorage, TurnStorage, sanitize_chat_id};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message unit in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("serializing history for {chat_id}: {source}")]
    Serialize {
        chat_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("persisting history for {chat_id}: {reason}")]
    Io { chat_id: String, reason: String },
}

pub struct HistoryStore {
    storage: Arc<dyn TurnStorage>,
    window: usize,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl HistoryStore {
    /// `window` is clamped to at least one turn.
    pub fn new(storage: Arc<dyn TurnStorage>, window: usize) -> Self {
        Self {
            storage,
            window: window.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Stored turns for `chat_id`, oldest first. Missing or unreadable records
    /// yield an empty conversation.
    pub async fn load(&self, chat_id: &str) -> Vec<Turn> {
        let key = sanitize_chat_id(chat_id);
        self.read_turns(chat_id, &key).await
    }

    /// Append `new_turns` in order, keep the last `window` turns and persist.
    pub async fn append(&self, chat_id: &str, new_turns: &[Turn]) -> Result<(), HistoryError> {
        let key = sanitize_chat_id(chat_id);
        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;

            let mut turns = self.read_turns(chat_id, &key).await;
            turns.extend_from_slice(new_turns);
            if turns.len() > self.window {
                let excess = turns.len() - self.window;
                turns.drain(..excess);
            }

            match serde_json::to_vec_pretty(&turns) {
                Ok(bytes) => self
                    .storage
                    .write(&key, &bytes)
                    .await
                    .map_err(|e| HistoryError::Io {
                        chat_id: chat_id.to_string(),
                        reason: format!("{e:#}"),
                    }),
                Err(source) => Err(HistoryError::Serialize {
                    chat_id: chat_id.to_string(),
                    source,
                }),
            }
        };
        drop(lock);
        self.release_lock(&key);
        result
    }

    async fn read_turns(&self, chat_id: &str, key: &str) -> Vec<Turn> {
        match self.storage.read(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<Turn>>(&bytes) {
                Ok(turns) => turns,
                Err(e) => {
                    tracing::warn!(chat_id, "Ignoring unreadable history record: {e}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(chat_id, "Failed to read history: {e:#}");
                Vec::new()
            }
        }
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the per-chat lock once nobody else holds or waits on it.
    fn release_lock(&self, key: &str) {
        let mut locks = self.locks.lock();
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().len()
    }
}
