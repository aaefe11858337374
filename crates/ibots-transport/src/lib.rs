//! # ibots Transport
//!
//! Platform transports for the ibots runtime.
//!
//! This crate provides implementations of the platform traits defined in
//! `ibots-core`. Transports make a single attempt per call; retry policy is
//! applied above them by `ApiClient`.
//!
//! ## Features
//!
//! - `http-client`: GraphQL over HTTPS against a live deployment
//! - `full`: All transports
//!
//! The in-process [`memory`] platform is always available.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  Bot runtime        │  (ApiClient: retry / no-retry policy)
//! ├─────────────────────┤
//! │  ibots-core         │  (PlatformApi, PlatformConnector)
//! ├─────────────────────┤
//! │  ibots-transport    │  <- This crate (implementations)
//! ├─────────────────────┤
//! │  HTTPS / memory     │
//! └─────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ibots_transport::http::HttpConnector;
//! use ibots_core::{ApiClient, Credentials, RetryConfig};
//!
//! let connector = HttpConnector::new("ibis.example.org");
//! let client = ApiClient::connect(&connector, &Credentials::new("bot", "pw"), RetryConfig::default()).await?;
//! let me = client.whoami().await?;
//! ```

pub mod memory;

#[cfg(feature = "http-client")]
pub mod http;

pub use memory::{MemoryPlatform, MemorySession, PlatformStats};

#[cfg(feature = "http-client")]
pub use http::HttpConnector;
