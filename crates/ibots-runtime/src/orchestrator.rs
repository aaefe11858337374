//! Bot supervision and the operator control surface.
//!
//! The [`Orchestrator`] owns every bot runtime and the shared
//! [`ResourceManager`]. Each bot gets a supervisor task, which runs the bot
//! in an inner task so a panicking handler faults only that bot. Faulted
//! bots are restarted with exponential backoff; after too many consecutive
//! faults the bot stays `Faulted` and the rest of the process carries on.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ibots_runtime::{Orchestrator, config::load_config};
//!
//! let orchestrator = Orchestrator::from_config(load_config()?)?;
//! orchestrator.register_handler::<HelloBot>();
//! orchestrator.run().await?;
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ibots_core::{
    BoxedConnector, ConfigurableHandler, ConfigurableResource, ResourceManager,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bot::{
    BotCommand, BotRuntime, BotStatus, RunHandles, RunOutcome, RunState, RuntimeSettings,
    RuntimeShared, StatusCell,
};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::{BotConfig, IbotsConfig, RestartConfig, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::registry::Registry;

/// Queued operator commands per bot.
const COMMAND_QUEUE: usize = 16;

/// A running bot's control handles.
struct BotControl {
    cancel: CancellationToken,
    commands: mpsc::Sender<BotCommand>,
    supervisor: JoinHandle<()>,
}

impl BotControl {
    fn is_running(&self) -> bool {
        !self.supervisor.is_finished()
    }
}

struct BotSlot {
    config: Arc<BotConfig>,
    status: StatusCell,
    control: Option<BotControl>,
}

impl BotSlot {
    fn is_running(&self) -> bool {
        self.control.as_ref().is_some_and(BotControl::is_running)
    }
}

/// Owns and supervises all bots.
pub struct Orchestrator {
    config: Arc<IbotsConfig>,
    registry: Arc<Registry>,
    shared: Arc<RuntimeShared>,
    bots: Mutex<BTreeMap<String, BotSlot>>,
}

impl Orchestrator {
    /// Creates an orchestrator persisting checkpoints under `global.state_dir`.
    pub fn new(config: IbotsConfig, connector: BoxedConnector) -> RuntimeResult<Self> {
        let store = Arc::new(FileCheckpointStore::new(&config.global.state_dir));
        Self::with_store(config, connector, store)
    }

    /// Creates an orchestrator talking HTTP to `global.endpoint`.
    #[cfg(feature = "http-client")]
    pub fn from_config(config: IbotsConfig) -> RuntimeResult<Self> {
        if config.global.endpoint.is_empty() {
            return Err(crate::config::ConfigError::missing_field("global.endpoint").into());
        }
        let connector = ibots_transport::HttpConnector::new(&config.global.endpoint);
        Self::new(config, Arc::new(connector))
    }

    /// Creates an orchestrator with a custom checkpoint store.
    pub fn with_store(
        config: IbotsConfig,
        connector: BoxedConnector,
        store: Arc<dyn CheckpointStore>,
    ) -> RuntimeResult<Self> {
        validate_config(&config)?;

        let shared = Arc::new(RuntimeShared {
            settings: RuntimeSettings::from_config(&config.global),
            connector,
            store,
            resources: Arc::new(ResourceManager::new()),
        });

        let bots = config
            .bots
            .iter()
            .map(|(id, bot)| {
                let slot = BotSlot {
                    config: Arc::new(bot.clone()),
                    status: StatusCell::new(id),
                    control: None,
                };
                (id.clone(), slot)
            })
            .collect();

        info!(
            bots = config.bots.len(),
            resources = config.resources.len(),
            "Orchestrator initialized from configuration"
        );

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(Registry::new()),
            shared,
            bots: Mutex::new(bots),
        })
    }

    pub fn config(&self) -> &IbotsConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.shared.resources
    }

    /// Registers a handler type under its configured name.
    pub fn register_handler<H: ConfigurableHandler>(&self) -> &Self {
        self.registry.register_handler::<H>();
        self
    }

    /// Registers a resource type under its configured kind.
    pub fn register_resource<R: ConfigurableResource>(&self) -> &Self {
        self.registry.register_resource::<R>();
        self
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Instantiates the resources and starts every enabled bot.
    pub async fn start(&self) -> RuntimeResult<()> {
        self.check_registry()?;
        self.init_resources()?;

        let enabled: Vec<String> = self.config.enabled_bots().map(str::to_string).collect();
        info!(bots = enabled.len(), registry = %self.registry.stats(), "Starting bots");
        for bot_id in enabled {
            if self.is_running(&bot_id) {
                continue;
            }
            self.start_bot(&bot_id)?;
        }
        Ok(())
    }

    /// Runs until Ctrl+C or SIGTERM, then shuts down.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;
        info!("ibots is now running. Press Ctrl+C to stop.");

        wait_for_shutdown().await;

        self.shutdown().await;
        Ok(())
    }

    /// Runs until `shutdown` completes, then shuts down.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.shutdown().await;
        Ok(())
    }

    /// Stops every bot, then every resource executor.
    pub async fn shutdown(&self) {
        let running: Vec<String> = self
            .bots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.control.is_some())
            .map(|(id, _)| id.clone())
            .collect();

        info!(bots = running.len(), "Shutting down");
        let stops = running.iter().map(|id| self.stop_bot(id));
        for (id, result) in running.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!(bot_id = %id, error = %e, "Failed to stop bot");
            }
        }

        self.shared.resources.shutdown().await;
        info!("Shutdown complete");
    }

    /// Every configured handler and resource kind must be registered.
    fn check_registry(&self) -> RuntimeResult<()> {
        for bot in self.config.bots.values() {
            if !self.registry.has_handler(&bot.handler) {
                return Err(RuntimeError::UnknownHandler(bot.handler.clone()));
            }
        }
        for resource in self.config.resources.values() {
            if !self.registry.has_resource(&resource.kind) {
                return Err(RuntimeError::UnknownResourceKind(resource.kind.clone()));
            }
        }
        Ok(())
    }

    fn init_resources(&self) -> RuntimeResult<()> {
        for (name, resource) in &self.config.resources {
            if self.shared.resources.contains(name) {
                continue;
            }
            let instance = self
                .registry
                .build_resource(&resource.kind, name, &resource.args)?;
            self.shared
                .resources
                .register(name, instance, resource.policy())?;
        }
        Ok(())
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Starts one bot under supervision.
    pub fn start_bot(&self, bot_id: &str) -> RuntimeResult<()> {
        self.init_resources()?;

        let mut bots = self.bots.lock();
        let slot = bots
            .get_mut(bot_id)
            .ok_or_else(|| RuntimeError::BotNotFound(bot_id.to_string()))?;
        if slot.is_running() {
            return Err(RuntimeError::BotRunning(bot_id.to_string()));
        }

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let handles = RunHandles {
            status: slot.status.clone(),
            commands: Arc::new(tokio::sync::Mutex::new(rx)),
            cancel: CancellationToken::new(),
        };
        handles.status.update(|s| {
            s.state = RunState::Starting;
            s.permanent_fault = false;
            s.restarts = 0;
        });

        let supervisor = Supervisor {
            bot_id: bot_id.to_string(),
            config: Arc::clone(&slot.config),
            registry: Arc::clone(&self.registry),
            shared: Arc::clone(&self.shared),
            restart: self.config.global.restart.clone(),
            handles: handles.clone(),
        };

        slot.control = Some(BotControl {
            cancel: handles.cancel,
            commands: tx,
            supervisor: tokio::spawn(supervisor.run()),
        });
        info!(bot_id, handler = %slot.config.handler, "Bot started");
        Ok(())
    }

    /// Stops one bot.
    ///
    /// The bot finishes its current batch first. If that takes longer than
    /// `global.stop_timeout_ms`, it is aborted and its last batch may be
    /// delivered again on the next start.
    pub async fn stop_bot(&self, bot_id: &str) -> RuntimeResult<()> {
        let (control, status) = {
            let mut bots = self.bots.lock();
            let slot = bots
                .get_mut(bot_id)
                .ok_or_else(|| RuntimeError::BotNotFound(bot_id.to_string()))?;
            (slot.control.take(), slot.status.clone())
        };
        let Some(mut control) = control else {
            debug!(bot_id, "Bot is not running");
            return Ok(());
        };

        control.cancel.cancel();
        let timeout = self.config.global.stop_timeout();
        match tokio::time::timeout(timeout, &mut control.supervisor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(bot_id, error = %e, "Supervisor ended abnormally"),
            Err(_) => {
                control.supervisor.abort();
                let _ = control.supervisor.await;
                status.set_state(RunState::Stopped);
                warn!(
                    bot_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Bot did not stop in time and was aborted, its last batch may be re-delivered"
                );
            }
        }
        Ok(())
    }

    /// Deletes a stopped bot's checkpoint. It restarts from the beginning of history.
    pub async fn reset_checkpoint(&self, bot_id: &str) -> RuntimeResult<()> {
        let status = {
            let bots = self.bots.lock();
            let slot = bots
                .get(bot_id)
                .ok_or_else(|| RuntimeError::BotNotFound(bot_id.to_string()))?;
            if slot.is_running() {
                return Err(RuntimeError::BotRunning(bot_id.to_string()));
            }
            slot.status.clone()
        };

        self.shared.store.reset(bot_id).await?;
        status.update(|s| s.last_checkpoint = None);
        info!(bot_id, "Checkpoint reset");
        Ok(())
    }

    /// Delivers an operator instruction to a running bot's `on_command`.
    ///
    /// Waits until the bot is between batches and has handled it.
    pub async fn send_command(&self, bot_id: &str, instruction: &str) -> RuntimeResult<()> {
        let sender = {
            let bots = self.bots.lock();
            let slot = bots
                .get(bot_id)
                .ok_or_else(|| RuntimeError::BotNotFound(bot_id.to_string()))?;
            match &slot.control {
                Some(control) if control.is_running() => control.commands.clone(),
                _ => return Err(RuntimeError::BotNotRunning(bot_id.to_string())),
            }
        };

        let (reply, answer) = oneshot::channel();
        let command = BotCommand {
            instruction: instruction.to_string(),
            reply,
        };
        let not_running = || RuntimeError::BotNotRunning(bot_id.to_string());
        sender.send(command).await.map_err(|_| not_running())?;
        answer.await.map_err(|_| not_running())??;
        Ok(())
    }

    /// Delivers an operator instruction to a resource.
    pub async fn resource_command(&self, name: &str, instruction: &str) -> RuntimeResult<Value> {
        Ok(self.shared.resources.command(name, instruction).await?)
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Status of every configured bot, ordered by id.
    pub fn status(&self) -> Vec<BotStatus> {
        self.bots
            .lock()
            .values()
            .map(|slot| slot.status.snapshot())
            .collect()
    }

    pub fn bot_status(&self, bot_id: &str) -> Option<BotStatus> {
        self.bots
            .lock()
            .get(bot_id)
            .map(|slot| slot.status.snapshot())
    }

    pub fn is_running(&self, bot_id: &str) -> bool {
        self.bots
            .lock()
            .get(bot_id)
            .is_some_and(BotSlot::is_running)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("bots", &self.bots.lock().keys().collect::<Vec<_>>())
            .field("registry", &self.registry)
            .finish()
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Restarts one bot according to the restart policy.
struct Supervisor {
    bot_id: String,
    config: Arc<BotConfig>,
    registry: Arc<Registry>,
    shared: Arc<RuntimeShared>,
    restart: RestartConfig,
    handles: RunHandles,
}

impl Supervisor {
    async fn run(self) {
        let status = self.handles.status.clone();
        let mut faults = 0u32;

        loop {
            let handler = match self.registry.build_handler(&self.config.handler, &self.config.args) {
                Ok(handler) => handler,
                Err(e) => {
                    self.give_up(&format!("failed to build handler: {e}"));
                    return;
                }
            };

            let cycles_before = status.snapshot().cycles;
            let runtime = BotRuntime::new(
                &self.bot_id,
                Arc::clone(&self.config),
                handler,
                Arc::clone(&self.shared),
                self.handles.clone(),
            );
            let span = info_span!("bot", bot_id = %self.bot_id);
            let task = AbortOnDropHandle::new(tokio::spawn(runtime.run().instrument(span)));

            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = join_error_message(e);
                    error!(bot_id = %self.bot_id, error = %error, "Bot task failed");
                    status.update(|s| {
                        s.state = RunState::Faulted;
                        s.last_error = Some(error.clone());
                    });
                    RunOutcome::Faulted {
                        error,
                        completed_cycle: status.snapshot().cycles > cycles_before,
                        recoverable: true,
                    }
                }
            };

            let RunOutcome::Faulted {
                error,
                completed_cycle,
                recoverable,
            } = outcome
            else {
                return;
            };

            if completed_cycle {
                faults = 0;
            }
            faults += 1;

            if !recoverable {
                self.give_up(&error);
                return;
            }
            if faults > self.restart.max_restarts {
                error!(
                    bot_id = %self.bot_id,
                    faults,
                    error = %error,
                    "Bot keeps faulting, giving up until it is started again"
                );
                status.update(|s| s.permanent_fault = true);
                return;
            }

            let delay = self.restart.delay_for(faults);
            warn!(
                bot_id = %self.bot_id,
                attempt = faults,
                delay_ms = delay.as_millis() as u64,
                "Restarting faulted bot"
            );
            if !self.wait(delay).await {
                status.set_state(RunState::Stopped);
                return;
            }
            status.update(|s| s.restarts += 1);
        }
    }

    /// Sleeps for `delay`. Returns false if the bot was stopped meanwhile.
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.handles.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn give_up(&self, error: &str) {
        error!(
            bot_id = %self.bot_id,
            error = %error,
            "Bot cannot recover, giving up until it is started again"
        );
        self.handles.status.update(|s| {
            s.state = RunState::Faulted;
            s.last_error = Some(error.to_string());
            s.permanent_fault = true;
        });
    }
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("handler panicked: {message}")
}

/// Waits for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }
}

// =============================================================================
// Tests
// =============================================================================
