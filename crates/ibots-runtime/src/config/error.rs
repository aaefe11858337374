//! Errors raised while loading and validating an [`IbotsConfig`](super::IbotsConfig).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist.
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    /// The merged sources do not deserialize.
    #[error("malformed configuration: {0}")]
    ParseError(String),

    #[error("invalid configuration: {message}")]
    ValidationError { message: String },

    #[error("missing required configuration field '{field}'")]
    MissingField { field: String },

    /// `bots.<id>.resources` names something absent from `resources`.
    #[error("bot '{bot_id}' is granted undeclared resource '{resource}'")]
    UndeclaredResource { bot_id: String, resource: String },

    #[error("invalid platform endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError { message: message.into() }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField { field: field.into() }
    }

    pub fn invalid_endpoint(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
