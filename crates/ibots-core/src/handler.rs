//! The bot handler interface.
//!
//! Business logic plugs into the runtime by implementing [`BotHandler`]. Every
//! hook has a no-op default, so a bot only overrides the entry kinds it cares
//! about. [`dispatch`] routes an entry to its hook with a `match` on
//! [`EntryKind`].
//!
//! Hooks receive a [`BotContext`], which carries the bot's API client, its
//! granted resource handles and its persisted state. Anything written to the
//! state is saved together with the history cursor.
//!
//! # Idempotence
//!
//! After a crash, the batch that was in flight is delivered again. Hooks must
//! make their observable effects idempotent, usually by recording the BIDs
//! they acted on in the persisted state. A failed batch only rewinds the
//! history cursor: the state is kept and saved, so those records survive.
//! Record a BID right after the effect it guards, before any later call that
//! can fail.
//!
//! # Example
//!
//! ```ignore
//! struct Greeter;
//!
//! #[async_trait]
//! impl BotHandler for Greeter {
//!     async fn on_post(&mut self, ctx: &mut BotContext, entry: &Entry) -> HandlerResult {
//!         let key = format!("greeted:{}", entry.bid);
//!         if ctx.get_state::<bool>(&key).is_none() {
//!             ctx.api().comment(&entry.bid, "Welcome!").await?;
//!             ctx.set_state(&key, true)?;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use crate::api::ApiClient;
use crate::bid::{Bid, EntryKind};
use crate::error::{HandlerError, HandlerResult, ResourceError, ResourceResult};
use crate::history::BotState;
use crate::model::Entry;
use crate::resource::ResourceHandle;

/// Per-bot business logic.
#[async_trait]
pub trait BotHandler: Send + 'static {
    /// Entry kinds this bot wants to receive. Empty means all.
    fn interests(&self) -> Vec<EntryKind> {
        Vec::new()
    }

    /// Called once after login and checkpoint load.
    async fn on_start(&mut self, _ctx: &mut BotContext) -> HandlerResult {
        Ok(())
    }

    /// Called once on a cooperative stop.
    async fn on_stop(&mut self, _ctx: &mut BotContext) -> HandlerResult {
        Ok(())
    }

    async fn on_post(&mut self, _ctx: &mut BotContext, _entry: &Entry) -> HandlerResult {
        Ok(())
    }

    async fn on_comment(&mut self, _ctx: &mut BotContext, _entry: &Entry) -> HandlerResult {
        Ok(())
    }

    async fn on_donation(&mut self, _ctx: &mut BotContext, _entry: &Entry) -> HandlerResult {
        Ok(())
    }

    async fn on_transaction(&mut self, _ctx: &mut BotContext, _entry: &Entry) -> HandlerResult {
        Ok(())
    }

    async fn on_news(&mut self, _ctx: &mut BotContext, _entry: &Entry) -> HandlerResult {
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &mut BotContext, _entry: &Entry) -> HandlerResult {
        Ok(())
    }

    /// Called after every completed poll cycle, for periodic work.
    async fn on_cycle(&mut self, _ctx: &mut BotContext) -> HandlerResult {
        Ok(())
    }

    /// Handles an operator instruction. Logged and ignored by default.
    async fn on_command(&mut self, ctx: &mut BotContext, instruction: &str) -> HandlerResult {
        info!(bot_id = %ctx.bot_id(), instruction, "Command ignored");
        Ok(())
    }
}

/// A boxed handler.
pub type BoxedHandler = Box<dyn BotHandler>;

/// Routes `entry` to the hook for its kind.
pub async fn dispatch(
    handler: &mut dyn BotHandler,
    ctx: &mut BotContext,
    entry: &Entry,
) -> HandlerResult {
    match entry.kind() {
        EntryKind::Post => handler.on_post(ctx, entry).await,
        EntryKind::Comment => handler.on_comment(ctx, entry).await,
        EntryKind::Donation => handler.on_donation(ctx, entry).await,
        EntryKind::Transaction => handler.on_transaction(ctx, entry).await,
        EntryKind::News => handler.on_news(ctx, entry).await,
        EntryKind::Event => handler.on_event(ctx, entry).await,
    }
}

/// A handler that can be built by name from configuration.
pub trait ConfigurableHandler: BotHandler + Sized {
    /// Typed `args` from the bot's config entry.
    type Args: DeserializeOwned + Default;

    /// The name used in the `handler` field of the config.
    fn name() -> &'static str;

    fn from_args(args: Self::Args) -> HandlerResult<Self>;
}

// =============================================================================
// Context
// =============================================================================

/// Everything a handler may touch while running.
pub struct BotContext {
    bot_id: Arc<str>,
    api: ApiClient,
    resources: HashMap<String, ResourceHandle>,
    state: BotState,
    dirty: bool,
}

impl BotContext {
    pub fn new(
        bot_id: impl Into<Arc<str>>,
        api: ApiClient,
        resources: HashMap<String, ResourceHandle>,
        state: BotState,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            api,
            resources,
            state,
            dirty: false,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// The bot's own BID on the platform.
    pub fn identity(&self) -> &Bid {
        self.api.identity()
    }

    /// Returns a granted resource.
    pub fn resource(&self, name: &str) -> ResourceResult<&ResourceHandle> {
        self.resources
            .get(name)
            .ok_or_else(|| ResourceError::NotGranted {
                name: name.to_string(),
                bot_id: self.bot_id.to_string(),
            })
    }

    /// Shorthand for `resource(name)?.invoke(operation, args)`.
    pub async fn invoke(&self, name: &str, operation: &str, args: Value) -> ResourceResult<Value> {
        self.resource(name)?.invoke(operation, args).await
    }

    pub fn state(&self) -> &BotState {
        &self.state
    }

    /// Mutable access to the persisted state.
    pub fn state_mut(&mut self) -> &mut BotState {
        self.dirty = true;
        &mut self.state
    }

    /// Reads a typed value. Missing or mistyped keys read as `None`.
    pub fn get_state<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.state
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set_state<T: Serialize>(&mut self, key: &str, value: T) -> HandlerResult {
        let value = serde_json::to_value(value)
            .map_err(|e| HandlerError::fatal(format!("state value '{key}' is not serializable: {e}")))?;
        self.state_mut().insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove_state(&mut self, key: &str) -> Option<Value> {
        self.state_mut().remove(key)
    }

    /// Whether the state changed since it was last saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears the changed flag, returning its previous value.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

impl std::fmt::Debug for BotContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotContext")
            .field("bot_id", &self.bot_id)
            .field("identity", self.identity())
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .finish()
    }
}
