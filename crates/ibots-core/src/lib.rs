//! # ibots Core
//!
//! The platform-independent building blocks of the ibots runtime.
//!
//! ibots are long-running bots acting on a social donation platform. They
//! are expected to crash and restart at any time, to see an event history
//! that is incomplete, reordered or replayed, and to never spend money twice.
//! This crate holds the pieces that make those assumptions safe:
//!
//! - **Identifiers**: [`Bid`] and the [`BidRegistry`] that resolves raw
//!   platform ids into them.
//! - **Data model**: [`Entry`], [`User`], [`Timestamp`], [`Cents`].
//! - **API policy**: [`ApiClient`] retries reads and never retries writes,
//!   over any [`PlatformApi`] transport.
//! - **History**: [`HistoryTracker`] deduplicates and orders each bot's
//!   event stream against its [`Checkpoint`].
//! - **Resources**: [`ResourceManager`] serializes access to shared state,
//!   with optional call budgets.
//! - **Handlers**: the [`BotHandler`] trait bots implement.
//!
//! ## Event Flow
//!
//! ```text
//! ┌─────────────┐   ┌────────────────┐   ┌────────────┐   ┌─────────────┐
//! │  ApiClient  │──▶│ HistoryTracker │──▶│  dispatch  │──▶│ BotHandler  │
//! │ (raw pages) │   │ (dedup, order) │   │ (by kind)  │   │  (on_post…) │
//! └─────────────┘   └────────────────┘   └────────────┘   └─────────────┘
//! ```
//!
//! The polling loop itself lives in `ibots-runtime`.

pub mod api;
pub mod bid;
pub mod error;
pub mod handler;
pub mod history;
pub mod model;
pub mod resource;

pub use api::{
    ApiClient, BoxedConnector, CommentThread, EntryPage, EntryQuery, Mutation, PlatformApi, PlatformConnector,
    RelationKind, RetryConfig, UserQuery,
};
pub use bid::{Bid, BidKind, BidRegistry, EntryKind, UserKind};
pub use error::{
    ApiError, ApiResult, HandlerError, HandlerResult, ResourceError, ResourceResult,
    UnknownKindError,
};
pub use handler::{BotContext, BotHandler, BoxedHandler, ConfigurableHandler, dispatch};
pub use history::{BotState, Checkpoint, Cursor, HistoryTracker, PageLimits};
pub use model::{Cents, Credentials, Entry, EntryPayload, Timestamp, User};
pub use resource::{
    BoxedResource, Budget, ConfigurableResource, Resource, ResourceHandle, ResourceManager,
    ResourcePolicy,
};

/// Re-exports for writing bots and resources.
pub mod prelude {
    pub use super::{
        ApiClient, ApiError, Bid, BotContext, BotHandler, Cents, ConfigurableHandler,
        ConfigurableResource, Entry, EntryKind, EntryPayload, HandlerError, HandlerResult,
        RelationKind, Resource, ResourceError, ResourceResult, Timestamp, User, UserKind,
    };
    pub use async_trait::async_trait;
}
