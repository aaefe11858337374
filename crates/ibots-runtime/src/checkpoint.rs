//! Durable checkpoint storage.
//!
//! Each bot owns one [`Checkpoint`]: its history cursor plus its free-form
//! state. A save either lands completely or not at all, so a crash at any
//! point leaves the previous checkpoint readable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ibots_core::Checkpoint;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{CheckpointError, CheckpointResult};

/// Storage for per-bot checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the last saved checkpoint, or `None` for a fresh bot.
    async fn load(&self, bot_id: &str) -> CheckpointResult<Option<Checkpoint>>;

    /// Replaces the checkpoint atomically.
    async fn save(&self, bot_id: &str, checkpoint: &Checkpoint) -> CheckpointResult<()>;

    /// Forgets the checkpoint. The bot restarts from the epoch.
    async fn reset(&self, bot_id: &str) -> CheckpointResult<()>;
}

// =============================================================================
// File Store
// =============================================================================

/// Stores `<dir>/<bot_id>.json`, written through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for `bot_id`.
    pub fn path_for(&self, bot_id: &str) -> PathBuf {
        self.dir.join(format!("{bot_id}.json"))
    }

    fn temp_path_for(&self, bot_id: &str) -> PathBuf {
        self.dir.join(format!(".{bot_id}.json.tmp"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, bot_id: &str) -> CheckpointResult<Option<Checkpoint>> {
        let path = self.path_for(bot_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(bot_id, path = %path.display(), "No checkpoint, starting from the epoch");
                return Ok(None);
            }
            Err(e) => return Err(CheckpointError::io(path, e)),
        };

        let checkpoint = serde_json::from_slice(&raw).map_err(|e| CheckpointError::Corrupt {
            bot_id: bot_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, bot_id: &str, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let encoded =
            serde_json::to_vec_pretty(checkpoint).map_err(|e| CheckpointError::Encode {
                bot_id: bot_id.to_string(),
                reason: e.to_string(),
            })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CheckpointError::io(&self.dir, e))?;

        let temp = self.temp_path_for(bot_id);
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| CheckpointError::io(&temp, e))?;
        file.write_all(&encoded)
            .await
            .map_err(|e| CheckpointError::io(&temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| CheckpointError::io(&temp, e))?;
        drop(file);

        let path = self.path_for(bot_id);
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| CheckpointError::io(&path, e))?;

        debug!(
            bot_id,
            cursor = %checkpoint.cursor.last_timestamp,
            seen = checkpoint.cursor.seen.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn reset(&self, bot_id: &str) -> CheckpointResult<()> {
        let path = self.path_for(bot_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(bot_id, path = %path.display(), "Checkpoint removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::io(path, e)),
        }
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// Keeps checkpoints in memory, for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    saves: Mutex<u64>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored checkpoint, without going through the async trait.
    pub fn get(&self, bot_id: &str) -> Option<Checkpoint> {
        self.checkpoints.lock().get(bot_id).cloned()
    }

    /// Seeds a checkpoint.
    pub fn insert(&self, bot_id: &str, checkpoint: Checkpoint) {
        self.checkpoints.lock().insert(bot_id.to_string(), checkpoint);
    }

    /// Number of successful saves so far.
    pub fn saves(&self) -> u64 {
        *self.saves.lock()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, bot_id: &str) -> CheckpointResult<Option<Checkpoint>> {
        Ok(self.get(bot_id))
    }

    async fn save(&self, bot_id: &str, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        self.insert(bot_id, checkpoint.clone());
        *self.saves.lock() += 1;
        Ok(())
    }

    async fn reset(&self, bot_id: &str) -> CheckpointResult<()> {
        self.checkpoints.lock().remove(bot_id);
        Ok(())
    }
}
