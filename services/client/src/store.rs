//! Durable per-user conversation snapshots.
//!
//! Snapshots only pre-populate the transcript after a reload; losing one is
//! never fatal, so callers log store failures and move on.

use async_trait::async_trait;
use pam_core::{ConversationSnapshot, SessionError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<ConversationSnapshot>, SessionError>;
    async fn save(&self, user_id: &str, snapshot: &ConversationSnapshot) -> Result<(), SessionError>;
}

/// One JSON file per user under a directory, written via temp file and rename.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        let safe: String = user_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("pam_conversation_{}.json", safe))
    }
}

fn storage_error(path: &Path, e: impl std::fmt::Display) -> SessionError {
    SessionError::Storage(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    #[instrument(skip(self))]
    async fn load(&self, user_id: &str) -> Result<Option<ConversationSnapshot>, SessionError> {
        let path = self.path_for(user_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(&path, e)),
        };
        match serde_json::from_str::<ConversationSnapshot>(&raw) {
            Ok(snapshot) => {
                debug!(messages = snapshot.messages.len(), "Loaded conversation snapshot");
                Ok(Some(snapshot))
            }
            Err(e) => {
                warn!("Ignoring unreadable snapshot at {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, snapshot), fields(messages = snapshot.messages.len()))]
    async fn save(&self, user_id: &str, snapshot: &ConversationSnapshot) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_error(&self.dir, e))?;
        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(snapshot).map_err(|e| storage_error(&path, e))?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| storage_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error(&path, e))?;
        Ok(())
    }
}

/// Keeps snapshots in memory; used by tests and hosts without a writable disk.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, ConversationSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, user_id: &str) -> Result<Option<ConversationSnapshot>, SessionError> {
        Ok(self.snapshots.lock().await.get(user_id).cloned())
    }

    async fn save(&self, user_id: &str, snapshot: &ConversationSnapshot) -> Result<(), SessionError> {
        self.snapshots
            .lock()
            .await
            .insert(user_id.to_string(), snapshot.clone());
        Ok(())
    }
}
