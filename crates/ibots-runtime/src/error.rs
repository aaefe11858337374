//! Runtime error types.

use std::path::PathBuf;

use ibots_core::{HandlerError, ResourceError};
use thiserror::Error;

pub use crate::config::{ConfigError, ConfigResult};

// =============================================================================
// Checkpoint Errors
// =============================================================================

/// Errors from a [`CheckpointStore`](crate::checkpoint::CheckpointStore).
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The storage could not be read or written.
    #[error("Checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored checkpoint could not be decoded.
    #[error("Checkpoint for bot '{bot_id}' is corrupt: {reason}")]
    Corrupt { bot_id: String, reason: String },

    /// A checkpoint could not be encoded.
    #[error("Failed to encode checkpoint for bot '{bot_id}': {reason}")]
    Encode { bot_id: String, reason: String },
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

// =============================================================================
// Runtime Errors
// =============================================================================

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// No handler is registered under this name.
    #[error("Unknown handler '{0}'")]
    UnknownHandler(String),

    /// No resource kind is registered under this name.
    #[error("Unknown resource kind '{0}'")]
    UnknownResourceKind(String),

    /// Bot not found.
    #[error("Bot not found: {0}")]
    BotNotFound(String),

    /// The operation needs the bot to be stopped.
    #[error("Bot '{0}' is running")]
    BotRunning(String),

    /// The operation needs the bot to be running.
    #[error("Bot '{0}' is not running")]
    BotNotRunning(String),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
