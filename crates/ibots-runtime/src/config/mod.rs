//! Configuration for the ibots runtime.
//!
//! Layered loading through figment, plus validation of the merged result.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    BotConfig, BudgetConfig, GlobalConfig, IbotsConfig, LogFormat, LogLevel, LogOutput,
    LogRotation, LoggingConfig, ResourceConfig, RestartConfig, RetryConfig, SpanEventConfig,
};
pub use validation::validate_config;
