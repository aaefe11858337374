//! Error types shared by the core components.
//!
//! Errors are grouped by the layer that produces them. Each group knows
//! whether it is transient, so the layer above can decide between "retry next
//! cycle" and "give up" without matching on every variant.

use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Identifier Errors
// =============================================================================

/// The platform reported an entity kind outside the known set.
///
/// Fatal for the offending item only; callers skip and log it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity kind '{tag}'")]
pub struct UnknownKindError {
    /// The tag as reported by the platform.
    pub tag: String,
}

impl UnknownKindError {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

// =============================================================================
// API Errors
// =============================================================================

/// Errors returned by platform API calls.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// A single attempt failed for a reason that may go away (network, 5xx).
    ///
    /// Produced by [`PlatformApi`](crate::api::PlatformApi) implementations.
    /// [`ApiClient`](crate::api::ApiClient) converts it into
    /// [`TransientFetch`](Self::TransientFetch) or
    /// [`TransientMutate`](Self::TransientMutate).
    #[error("transient platform failure: {0}")]
    Transient(String),

    /// A read kept failing after every allowed attempt.
    #[error("fetch failed after {attempts} attempt(s): {reason}")]
    TransientFetch {
        /// Number of attempts made.
        attempts: u32,
        /// Last failure reason.
        reason: String,
    },

    /// A write failed in transit. Its outcome on the platform is unknown and it
    /// is never resubmitted automatically.
    #[error("mutation outcome unknown: {0}")]
    TransientMutate(String),

    /// Credentials were rejected.
    #[error("authentication failed for '{username}'")]
    Unauthorized {
        /// The username that failed to log in.
        username: String,
    },

    /// The platform understood the request and refused it.
    #[error("platform rejected request: {0}")]
    Rejected(String),

    /// The request was refused locally before reaching the network.
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    /// Failed to serialize or deserialize a payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An item carried an unknown kind tag.
    #[error(transparent)]
    UnknownKind(#[from] UnknownKindError),
}

impl ApiError {
    /// Whether retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::TransientFetch { .. } | Self::TransientMutate(_)
        )
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// =============================================================================
// Resource Errors
// =============================================================================

/// Errors raised by the resource manager and resource handles.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// The resource is not declared in the configuration.
    #[error("unknown resource '{name}'")]
    UnknownResource {
        /// Requested resource name.
        name: String,
    },

    /// The resource exists but was not granted to the requesting bot.
    #[error("resource '{name}' is not granted to bot '{bot_id}'")]
    NotGranted {
        /// Requested resource name.
        name: String,
        /// Requesting bot.
        bot_id: String,
    },

    /// The budget did not free up before the invoke timeout.
    #[error("resource '{name}' timed out after {waited:?}")]
    Timeout {
        /// Resource name.
        name: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The resource executor has shut down.
    #[error("resource '{name}' is unavailable")]
    Unavailable {
        /// Resource name.
        name: String,
    },

    /// The resource does not know the requested operation.
    #[error("resource '{name}' does not support operation '{operation}'")]
    UnsupportedOperation {
        /// Resource name.
        name: String,
        /// Requested operation.
        operation: String,
    },

    /// The operation ran and failed.
    #[error("resource '{name}' failed: {reason}")]
    Failed {
        /// Resource name.
        name: String,
        /// Failure reason.
        reason: String,
    },
}

impl ResourceError {
    /// Creates an operation failure.
    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            name: name.into(),
            operation: operation.into(),
        }
    }

    /// Whether retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

// =============================================================================
// Handler Errors
// =============================================================================

/// Errors returned from bot handler hooks.
///
/// `Transient` abandons the current batch; it is retried next cycle from the
/// last persisted checkpoint. `Fatal` faults the bot and hands it to the
/// orchestrator's restart policy.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Retry the batch on the next cycle.
    #[error("transient handler failure: {0}")]
    Transient(String),

    /// Stop the bot.
    #[error("handler fault: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<ApiError> for HandlerError {
    fn from(err: ApiError) -> Self {
        match &err {
            // Re-running the batch would re-run the write whose outcome is unknown.
            ApiError::TransientMutate(_) => Self::Fatal(err.to_string()),
            e if e.is_transient() => Self::Transient(err.to_string()),
            _ => Self::Fatal(err.to_string()),
        }
    }
}

impl From<ResourceError> for HandlerError {
    fn from(err: ResourceError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for API calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Result type for handler hooks.
pub type HandlerResult<T = ()> = Result<T, HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_classification() {
        let fetch = ApiError::TransientFetch {
            attempts: 5,
            reason: "reset".into(),
        };
        assert!(!HandlerError::from(fetch).is_fatal());
        assert!(HandlerError::from(ApiError::TransientMutate("timeout".into())).is_fatal());
        assert!(HandlerError::from(ApiError::Rejected("no".into())).is_fatal());

        let timeout = ResourceError::Timeout {
            name: "ledger".into(),
            waited: Duration::from_secs(1),
        };
        assert!(!HandlerError::from(timeout).is_fatal());
        assert!(HandlerError::from(ResourceError::unsupported("ledger", "x")).is_fatal());
    }
}
