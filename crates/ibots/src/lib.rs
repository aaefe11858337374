//! # ibots
//!
//! A runtime for long-running bots on a social donation platform.
//!
//! ## Overview
//!
//! Bots are independent workers. Each one logs in with its own credentials,
//! polls the platform's event history, reacts to new entries and persists a
//! checkpoint so it can crash and resume without handling an entry twice.
//! Shared resources are reached through a serialized executor with optional
//! call budgets, so concurrent bots never race on them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────────────────────────┐
//! │ Orchestrator │────▶│ Bot "greeter" (own task, checkpoint) │──┐
//! │ (supervisor) │────▶│ Bot "donor"   (own task, checkpoint) │──┤
//! └──────────────┘     └──────────────────────────────────────┘  │
//!                                                                 ▼
//!                      ┌───────────────────┐     ┌──────────────────────────┐
//!                      │ ResourceManager   │◀────│ ApiClient (per bot)      │
//!                      │ (one executor per │     │ reads retried, writes    │
//!                      │  shared resource) │     │ sent at most once        │
//!                      └───────────────────┘     └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ibots::prelude::*;
//!
//! #[derive(Default)]
//! struct Greeter;
//!
//! #[async_trait]
//! impl BotHandler for Greeter {
//!     async fn on_post(&mut self, ctx: &mut BotContext, entry: &Entry) -> HandlerResult {
//!         ctx.api().comment(&entry.bid, "Welcome!").await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::from_config(load_config()?)?;
//!     orchestrator.registry().register_handler_fn("greeter", |_| Ok(Box::new(Greeter)));
//!     orchestrator.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: TOML configuration files (default)
//! - `json-config`: JSON configuration files
//! - `json-log`: JSON log output
//! - `http-client`: the HTTP platform transport

pub use ibots_core as core;
pub use ibots_runtime as runtime;
pub use ibots_transport as transport;

/// Prelude module for convenient imports.
///
/// This module provides all commonly used types for building bots:
///
/// ```rust,ignore
/// use ibots::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use ibots_runtime::Orchestrator;
    pub use ibots_runtime::config::{IbotsConfig, load_config, load_config_from_file};

    // Bot and resource authoring
    pub use ibots_core::prelude::*;

    // Status reporting
    pub use ibots_runtime::{BotStatus, RunState};
}
