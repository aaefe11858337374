//! ibots Runtime - Orchestration layer for ibots.
//!
//! Everything that turns handlers into running bots:
//! - The per-bot polling loop (`bot`)
//! - Supervision, restarts and the operator surface (`Orchestrator`)
//! - Durable checkpoints (`CheckpointStore`)
//! - Handler and resource registration by configured name (`Registry`)
//! - Layered configuration and logging
//!
//! # Running Bots
//!
//! ```ignore
//! use ibots_runtime::{Orchestrator, config::load_config, logging};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     logging::init_from_config(&config.logging);
//!
//!     let orchestrator = Orchestrator::from_config(config)?;
//!     orchestrator.register_handler::<HelloBot>();
//!     orchestrator.register_resource::<Ledger>();
//!
//!     // Until Ctrl+C or SIGTERM
//!     orchestrator.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Failure Handling
//!
//! A bot that fails transiently retries from its last checkpoint on the next
//! poll. A bot that faults is restarted with exponential backoff, up to
//! `global.restart.max_restarts` consecutive times. Other bots are never
//! affected.

pub mod bot;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod registry;

pub use bot::{BotStatus, RunOutcome, RunState, RuntimeSettings};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{BotConfig, ConfigError, ConfigLoader, ConfigResult, GlobalConfig, IbotsConfig};
pub use error::{CheckpointError, CheckpointResult, RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use orchestrator::Orchestrator;
pub use registry::{Registry, RegistryStats};
