//! The per-bot polling loop.
//!
//! A [`BotRuntime`] drives one handler through
//! `Starting → Polling → Dispatching → Polling … → Stopped`, with `Faulted`
//! reachable from any state:
//!
//! - **Starting**: log in, acquire the granted resources, load the checkpoint
//!   (or start from the epoch) and call `on_start`.
//! - **Polling**: fetch the next page after the cursor and plan a batch.
//! - **Dispatching**: hand every entry to its hook, in `(timestamp, BID)` order.
//!
//! A transient failure rolls the cursor back to the last persisted checkpoint
//! and the batch is re-derived next cycle. The handler's state is kept and
//! saved with the old cursor, so the BIDs it recorded survive re-delivery. A fatal failure ends
//! the run as faulted; the orchestrator decides whether to restart.
//! Cancellation is observed only between batches.

use std::sync::Arc;
use std::time::Duration;

use ibots_core::{
    ApiClient, ApiError, BotContext, BoxedConnector, BoxedHandler, Checkpoint, Cursor, Entry,
    EntryKind, HandlerError, HandlerResult, HistoryTracker, PageLimits, ResourceManager,
    RetryConfig, dispatch,
};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{BotConfig, GlobalConfig};
use crate::error::CheckpointError;

/// Lifecycle state of a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Starting,
    Polling,
    Dispatching,
    Stopped,
    Faulted,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Polling => write!(f, "Polling"),
            Self::Dispatching => write!(f, "Dispatching"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Faulted => write!(f, "Faulted"),
        }
    }
}

/// A point-in-time view of one bot.
#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub bot_id: String,
    pub state: RunState,
    /// Cursor of the last durable checkpoint.
    pub last_checkpoint: Option<Cursor>,
    pub last_error: Option<String>,
    /// Restarts performed by the supervisor.
    pub restarts: u32,
    /// Entries handled successfully, including re-deliveries.
    pub dispatched: u64,
    /// Completed poll cycles.
    pub cycles: u64,
    /// The supervisor gave up on this bot.
    pub permanent_fault: bool,
}

impl BotStatus {
    fn new(bot_id: &str) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            state: RunState::Stopped,
            last_checkpoint: None,
            last_error: None,
            restarts: 0,
            dispatched: 0,
            cycles: 0,
            permanent_fault: false,
        }
    }
}

/// Shared, lock-protected [`BotStatus`].
#[derive(Debug, Clone)]
pub(crate) struct StatusCell(Arc<RwLock<BotStatus>>);

impl StatusCell {
    pub(crate) fn new(bot_id: &str) -> Self {
        Self(Arc::new(RwLock::new(BotStatus::new(bot_id))))
    }

    pub(crate) fn snapshot(&self) -> BotStatus {
        self.0.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> RunState {
        self.0.read().state
    }

    pub(crate) fn set_state(&self, state: RunState) {
        let mut status = self.0.write();
        let old_state = status.state;
        if old_state == state {
            return;
        }
        status.state = state;
        debug!(
            bot_id = %status.bot_id,
            old_state = %old_state,
            new_state = %state,
            "Bot state changed"
        );
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut BotStatus)) {
        f(&mut self.0.write());
    }
}

/// An operator instruction and the channel for the handler's answer.
#[derive(Debug)]
pub(crate) struct BotCommand {
    pub instruction: String,
    pub reply: oneshot::Sender<HandlerResult>,
}

/// Loop timing and persistence settings shared by all bots.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub limits: PageLimits,
    /// Persist after this many dispatched entries. 0 persists once per batch.
    pub checkpoint_batch: usize,
    pub read_retry: RetryConfig,
}

impl RuntimeSettings {
    pub fn from_config(global: &GlobalConfig) -> Self {
        Self {
            poll_interval: global.poll_interval(),
            limits: global.page_limits(),
            checkpoint_batch: global.checkpoint_batch,
            read_retry: global.read_retry.to_core_retry(),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&GlobalConfig::default())
    }
}

/// Dependencies every runtime shares with the orchestrator.
pub(crate) struct RuntimeShared {
    pub settings: RuntimeSettings,
    pub connector: BoxedConnector,
    pub store: Arc<dyn CheckpointStore>,
    pub resources: Arc<ResourceManager>,
}

/// Per-bot handles that outlive a single run.
#[derive(Clone)]
pub(crate) struct RunHandles {
    pub status: StatusCell,
    pub commands: Arc<Mutex<mpsc::Receiver<BotCommand>>>,
    pub cancel: CancellationToken,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Cooperative stop.
    Stopped,
    Faulted {
        error: String,
        /// At least one poll cycle finished before the fault.
        completed_cycle: bool,
        /// Whether a restart can help.
        recoverable: bool,
    },
}

/// Why a cycle was cut short.
#[derive(Debug)]
enum Interrupt {
    /// Retry from the last checkpoint next cycle.
    Transient(String),
    Fatal { error: String, recoverable: bool },
}

impl Interrupt {
    fn fatal(error: impl ToString) -> Self {
        Self::Fatal {
            error: error.to_string(),
            recoverable: true,
        }
    }

    fn unrecoverable(error: impl ToString) -> Self {
        Self::Fatal {
            error: error.to_string(),
            recoverable: false,
        }
    }
}

impl From<&HandlerError> for Interrupt {
    fn from(err: &HandlerError) -> Self {
        match err {
            HandlerError::Transient(_) => Self::Transient(err.to_string()),
            HandlerError::Fatal(_) => Self::fatal(err),
        }
    }
}

/// Runs one bot until it is cancelled or faults.
pub(crate) struct BotRuntime {
    bot_id: Arc<str>,
    config: Arc<BotConfig>,
    handler: BoxedHandler,
    shared: Arc<RuntimeShared>,
    handles: RunHandles,
}

impl BotRuntime {
    pub(crate) fn new(
        bot_id: &str,
        config: Arc<BotConfig>,
        handler: BoxedHandler,
        shared: Arc<RuntimeShared>,
        handles: RunHandles,
    ) -> Self {
        Self {
            bot_id: Arc::from(bot_id),
            config,
            handler,
            shared,
            handles,
        }
    }

    pub(crate) async fn run(mut self) -> RunOutcome {
        self.handles.status.set_state(RunState::Starting);
        let (mut tracker, mut ctx) = match self.start().await {
            Ok(parts) => parts,
            Err(interrupt) => return self.fault(interrupt, false),
        };

        let interests = self.handler.interests();
        let cancel = self.handles.cancel.clone();
        let commands = Arc::clone(&self.handles.commands);
        let mut commands = commands.lock().await;
        let mut completed_cycle = false;

        'run: loop {
            if cancel.is_cancelled() {
                break;
            }

            self.handles.status.set_state(RunState::Polling);
            match self.cycle(&mut tracker, &mut ctx, &interests).await {
                Ok(true) => {
                    completed_cycle = true;
                    self.handles.status.update(|s| s.cycles += 1);
                }
                Ok(false) => {}
                Err(Interrupt::Transient(error)) => {
                    warn!(error = %error, "Cycle failed, retrying from the last checkpoint");
                    self.handles
                        .status
                        .update(|s| s.last_error = Some(error));
                }
                Err(fatal) => return self.fault(fatal, completed_cycle),
            }

            let sleep = tokio::time::sleep(self.shared.settings.poll_interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'run,
                    Some(command) = commands.recv() => {
                        if let Err(fatal) = self.command(&mut tracker, &mut ctx, command).await {
                            return self.fault(fatal, completed_cycle);
                        }
                    }
                    _ = &mut sleep => break,
                }
            }
        }

        let result = self.handler.on_stop(&mut ctx).await;
        if let Err(interrupt) = self.settle(&mut tracker, &mut ctx, &result).await {
            warn!(error = ?interrupt, "on_stop failed");
        }
        self.handles.status.set_state(RunState::Stopped);
        info!("Bot stopped");
        RunOutcome::Stopped
    }

    async fn start(&mut self) -> Result<(HistoryTracker, BotContext), Interrupt> {
        let shared = Arc::clone(&self.shared);

        let api = ApiClient::connect(
            shared.connector.as_ref(),
            &self.config.credentials(),
            shared.settings.read_retry.clone(),
        )
        .await
        .map_err(|e| match e {
            ApiError::Unauthorized { .. } => Interrupt::unrecoverable(e),
            e => Interrupt::fatal(e),
        })?;

        let resources = shared
            .resources
            .acquire_all(&self.bot_id, &self.config.resources)
            .map_err(Interrupt::unrecoverable)?;

        let checkpoint = match shared.store.load(&self.bot_id).await {
            Ok(Some(checkpoint)) => {
                info!(
                    cursor = %checkpoint.cursor.last_timestamp,
                    seen = checkpoint.cursor.seen.len(),
                    "Resuming from checkpoint"
                );
                let cursor = checkpoint.cursor.clone();
                self.handles
                    .status
                    .update(|s| s.last_checkpoint = Some(cursor));
                checkpoint
            }
            Ok(None) => {
                info!("No checkpoint, starting from the beginning of history");
                Checkpoint::default()
            }
            Err(e @ CheckpointError::Corrupt { .. }) => return Err(Interrupt::unrecoverable(e)),
            Err(e) => return Err(Interrupt::fatal(e)),
        };

        let mut tracker = HistoryTracker::new(checkpoint.clone(), shared.settings.limits);
        let mut ctx = BotContext::new(Arc::clone(&self.bot_id), api, resources, checkpoint.state);

        let result = self.handler.on_start(&mut ctx).await;
        match self.settle(&mut tracker, &mut ctx, &result).await {
            Ok(()) => {}
            Err(Interrupt::Transient(error)) => return Err(Interrupt::fatal(error)),
            Err(fatal) => return Err(fatal),
        }

        info!(identity = %ctx.identity(), "Bot started");
        Ok((tracker, ctx))
    }

    /// One poll cycle. Returns whether the fetch succeeded.
    async fn cycle(
        &mut self,
        tracker: &mut HistoryTracker,
        ctx: &mut BotContext,
        interests: &[EntryKind],
    ) -> Result<bool, Interrupt> {
        let query = tracker.next_query(interests);
        let page = match ctx.api().fetch_page(&query).await {
            Ok(page) => page,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Fetch failed, no new data this cycle");
                return Ok(false);
            }
            Err(e) => return Err(Interrupt::fatal(e)),
        };

        let batch = tracker.plan(page);
        if !batch.is_empty() {
            self.handles.status.set_state(RunState::Dispatching);
            debug!(entries = batch.len(), "Dispatching batch");
            if let Err(interrupt) = self.dispatch_batch(tracker, ctx, &batch).await {
                self.recover(tracker, ctx).await;
                return Err(interrupt);
            }
            self.handles.status.set_state(RunState::Polling);
        }

        let result = self.handler.on_cycle(ctx).await;
        self.settle(tracker, ctx, &result).await?;
        Ok(true)
    }

    async fn dispatch_batch(
        &mut self,
        tracker: &mut HistoryTracker,
        ctx: &mut BotContext,
        batch: &[Entry],
    ) -> Result<(), Interrupt> {
        let checkpoint_batch = self.shared.settings.checkpoint_batch;

        for entry in batch {
            if let Err(e) = dispatch(&mut *self.handler, ctx, entry).await {
                warn!(bid = %entry.bid, error = %e, "Handler failed");
                return Err(Interrupt::from(&e));
            }
            tracker.mark_dispatched(entry);
            self.handles.status.update(|s| s.dispatched += 1);

            if checkpoint_batch > 0 && tracker.pending() >= checkpoint_batch {
                self.persist(tracker, ctx).await?;
            }
        }

        if tracker.pending() > 0 || ctx.is_dirty() {
            self.persist(tracker, ctx).await?;
        }
        Ok(())
    }

    async fn command(
        &mut self,
        tracker: &mut HistoryTracker,
        ctx: &mut BotContext,
        command: BotCommand,
    ) -> Result<(), Interrupt> {
        info!(instruction = %command.instruction, "Operator command");
        let result = self.handler.on_command(ctx, &command.instruction).await;
        let settled = self.settle(tracker, ctx, &result).await;
        let _ = command.reply.send(result);

        match settled {
            Err(Interrupt::Transient(error)) => {
                warn!(error = %error, "Command failed");
                Ok(())
            }
            other => other,
        }
    }

    /// Persists state changed outside a batch, or recovers on failure.
    async fn settle(
        &mut self,
        tracker: &mut HistoryTracker,
        ctx: &mut BotContext,
        result: &HandlerResult,
    ) -> Result<(), Interrupt> {
        match result {
            Ok(()) if ctx.is_dirty() || tracker.pending() > 0 => {
                let saved = self.persist(tracker, ctx).await;
                if saved.is_err() {
                    tracker.rollback();
                }
                saved
            }
            Ok(()) => Ok(()),
            Err(e) => {
                self.recover(tracker, ctx).await;
                Err(Interrupt::from(e))
            }
        }
    }

    /// Rewinds the cursor after a failure and saves the handler's state with
    /// it, so the next run re-delivers the batch with its records intact.
    async fn recover(&mut self, tracker: &mut HistoryTracker, ctx: &mut BotContext) {
        tracker.rollback();
        if !ctx.is_dirty() {
            return;
        }
        if let Err(interrupt) = self.persist(tracker, ctx).await {
            warn!(error = ?interrupt, "Could not save bot state after a failure");
        }
    }

    async fn persist(
        &mut self,
        tracker: &mut HistoryTracker,
        ctx: &mut BotContext,
    ) -> Result<(), Interrupt> {
        let checkpoint = tracker.snapshot(ctx.state());
        self.shared
            .store
            .save(&self.bot_id, &checkpoint)
            .await
            .map_err(|e| Interrupt::Transient(e.to_string()))?;

        let cursor = checkpoint.cursor.clone();
        tracker.commit(checkpoint);
        ctx.take_dirty();
        self.handles
            .status
            .update(|s| s.last_checkpoint = Some(cursor));
        Ok(())
    }

    fn fault(&self, interrupt: Interrupt, completed_cycle: bool) -> RunOutcome {
        let (error, recoverable) = match interrupt {
            Interrupt::Transient(error) => (error, true),
            Interrupt::Fatal { error, recoverable } => (error, recoverable),
        };
        error!(error = %error, recoverable, "Bot faulted");
        self.handles.status.update(|s| {
            s.state = RunState::Faulted;
            s.last_error = Some(error.clone());
        });
        RunOutcome::Faulted {
            error,
            completed_cycle,
            recoverable,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use async_trait::async_trait;
    use ibots_core::{Bid, BotHandler, Cents, EntryPayload, Timestamp, UserKind};
    use ibots_transport::MemoryPlatform;

    #[derive(Default)]
    struct Journal {
        /// Every delivery.
        seen: parking_lot::Mutex<Vec<Bid>>,
        /// External effects, guarded by a `done:<bid>` state record.
        effects: parking_lot::Mutex<Vec<Bid>>,
        commands: parking_lot::Mutex<Vec<String>>,
        transient_on: parking_lot::Mutex<Option<Bid>>,
        fatal_on: Option<Bid>,
    }

    struct Recorder(Arc<Journal>);

    #[async_trait]
    impl BotHandler for Recorder {
        fn interests(&self) -> Vec<EntryKind> {
            vec![EntryKind::Post]
        }

        async fn on_post(&mut self, ctx: &mut BotContext, entry: &Entry) -> HandlerResult {
            if self.0.fatal_on.as_ref() == Some(&entry.bid) {
                return Err(HandlerError::fatal("cannot handle this post"));
            }
            if self.0.transient_on.lock().take_if(|bid| *bid == entry.bid).is_some() {
                return Err(HandlerError::transient("try again later"));
            }

            self.0.seen.lock().push(entry.bid.clone());
            let done = format!("done:{}", entry.bid);
            if ctx.get_state::<bool>(&done).is_none() {
                self.0.effects.lock().push(entry.bid.clone());
                ctx.set_state(&done, true)?;
                let count: u64 = ctx.get_state("count").unwrap_or(0);
                ctx.set_state("count", count + 1)?;
            }
            Ok(())
        }

        async fn on_command(&mut self, _ctx: &mut BotContext, instruction: &str) -> HandlerResult {
            if instruction == "explode" {
                return Err(HandlerError::fatal("exploded"));
            }
            self.0.commands.lock().push(instruction.to_string());
            Ok(())
        }
    }

    struct Harness {
        platform: MemoryPlatform,
        author: Bid,
        store: Arc<MemoryCheckpointStore>,
        shared: Arc<RuntimeShared>,
    }

    impl Harness {
        fn new() -> Self {
            let platform = MemoryPlatform::new();
            platform.add_user(UserKind::Person, "bot", "pw", "Bot", Cents(0));
            let author = platform.add_user(UserKind::Person, "alice", "pw", "Alice", Cents(0));
            let store = Arc::new(MemoryCheckpointStore::new());
            let shared = Arc::new(RuntimeShared {
                settings: RuntimeSettings {
                    poll_interval: Duration::from_secs(1),
                    limits: PageLimits::default(),
                    checkpoint_batch: 0,
                    read_retry: RetryConfig::none(),
                },
                connector: Arc::new(platform.clone()),
                store: store.clone(),
                resources: Arc::new(ResourceManager::new()),
            });
            Self {
                platform,
                author,
                store,
                shared,
            }
        }

        fn post(&self, id: &str, created: i64) -> Bid {
            let bid = Bid::entry(EntryKind::Post, id);
            self.platform.insert_entry(Entry {
                bid: bid.clone(),
                created: Timestamp::from_millis(created),
                author: self.author.clone(),
                payload: EntryPayload::Post {
                    title: id.to_string(),
                    description: String::new(),
                },
            });
            bid
        }

        fn spawn(
            &self,
            journal: &Arc<Journal>,
            password: &str,
        ) -> (
            tokio::task::JoinHandle<RunOutcome>,
            RunHandles,
            mpsc::Sender<BotCommand>,
        ) {
            let config = Arc::new(BotConfig {
                handler: "recorder".into(),
                username: "bot".into(),
                password: password.into(),
                resources: Vec::new(),
                args: serde_json::Value::Null,
                enabled: true,
            });
            let (tx, rx) = mpsc::channel(4);
            let handles = RunHandles {
                status: StatusCell::new("recorder"),
                commands: Arc::new(Mutex::new(rx)),
                cancel: CancellationToken::new(),
            };
            let runtime = BotRuntime::new(
                "recorder",
                config,
                Box::new(Recorder(Arc::clone(journal))),
                Arc::clone(&self.shared),
                handles.clone(),
            );
            (tokio::spawn(runtime.run()), handles, tx)
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_run_future_is_send() {
        fn assert_send<F: std::future::Future + Send>(_: fn(BotRuntime) -> F) {}
        assert_send(BotRuntime::run);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_in_order_and_resumes_without_redelivery() {
        let harness = Harness::new();
        let b = harness.post("b", 10);
        let a = harness.post("a", 10);
        let journal = Arc::new(Journal::default());

        let (task, handles, _tx) = harness.spawn(&journal, "pw");
        wait_until(|| handles.status.snapshot().cycles >= 1).await;
        assert_eq!(*journal.seen.lock(), vec![a.clone(), b.clone()]);

        let checkpoint = harness.store.get("recorder").unwrap();
        assert_eq!(checkpoint.cursor, Cursor::at(Timestamp::from_millis(10), [a, b]));
        assert_eq!(checkpoint.state["count"], 2);

        handles.cancel.cancel();
        assert_eq!(task.await.unwrap(), RunOutcome::Stopped);
        assert_eq!(handles.status.state(), RunState::Stopped);

        // A new run resumes from the checkpoint and only sees the new post.
        let c = harness.post("c", 11);
        let journal = Arc::new(Journal::default());
        let (task, handles, _tx) = harness.spawn(&journal, "pw");
        wait_until(|| handles.status.snapshot().cycles >= 1).await;
        assert_eq!(*journal.seen.lock(), vec![c]);

        handles.cancel.cancel();
        task.await.unwrap();
        assert_eq!(harness.store.get("recorder").unwrap().state["count"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_keeps_handler_records() {
        let harness = Harness::new();
        let a = harness.post("a", 10);
        let b = harness.post("b", 11);
        let journal = Arc::new(Journal::default());
        *journal.transient_on.lock() = Some(b.clone());

        let (task, handles, _tx) = harness.spawn(&journal, "pw");
        wait_until(|| journal.seen.lock().len() >= 3).await;

        // `a` is re-delivered, but its record survived the rollback.
        assert_eq!(*journal.seen.lock(), vec![a.clone(), a.clone(), b.clone()]);
        assert_eq!(*journal.effects.lock(), vec![a, b.clone()]);
        let checkpoint = harness.store.get("recorder").unwrap();
        assert_eq!(checkpoint.cursor, Cursor::at(Timestamp::from_millis(11), [b]));
        assert_eq!(checkpoint.state["count"], 2);
        assert!(handles.status.snapshot().last_error.is_some());

        handles.cancel.cancel();
        assert_eq!(task.await.unwrap(), RunOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_keeps_previous_cursor() {
        let harness = Harness::new();
        let a = harness.post("a", 10);
        let bad = harness.post("bad", 11);
        let journal = Arc::new(Journal {
            fatal_on: Some(bad.clone()),
            ..Default::default()
        });

        let (task, handles, _tx) = harness.spawn(&journal, "pw");
        let outcome = task.await.unwrap();

        assert!(matches!(
            outcome,
            RunOutcome::Faulted {
                completed_cycle: false,
                recoverable: true,
                ..
            }
        ));
        assert_eq!(handles.status.state(), RunState::Faulted);
        // The cursor never moved, but the record for `a` was saved.
        let checkpoint = harness.store.get("recorder").unwrap();
        assert_eq!(checkpoint.cursor, Cursor::default());
        assert_eq!(checkpoint.state["count"], 1);

        // The next run sees `a` again without repeating its effect.
        let journal = Arc::new(Journal::default());
        let (task, handles, _tx) = harness.spawn(&journal, "pw");
        wait_until(|| handles.status.snapshot().cycles >= 1).await;
        assert_eq!(*journal.seen.lock(), vec![a, bad.clone()]);
        assert_eq!(*journal.effects.lock(), vec![bad]);

        handles.cancel.cancel();
        task.await.unwrap();
        assert_eq!(harness.store.get("recorder").unwrap().state["count"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_batch_persists_mid_batch() {
        let mut harness = Harness::new();
        Arc::get_mut(&mut harness.shared).unwrap().settings.checkpoint_batch = 1;
        harness.post("a", 10);
        let b = harness.post("b", 11);
        let bad = harness.post("bad", 12);
        let journal = Arc::new(Journal {
            fatal_on: Some(bad),
            ..Default::default()
        });

        let (task, _handles, _tx) = harness.spawn(&journal, "pw");
        assert!(matches!(task.await.unwrap(), RunOutcome::Faulted { .. }));

        let checkpoint = harness.store.get("recorder").unwrap();
        assert_eq!(checkpoint.cursor, Cursor::at(Timestamp::from_millis(11), [b]));
        assert_eq!(harness.store.saves(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_credentials_are_unrecoverable() {
        let harness = Harness::new();
        let journal = Arc::new(Journal::default());

        let (task, handles, _tx) = harness.spawn(&journal, "wrong");
        let outcome = task.await.unwrap();

        assert!(matches!(
            outcome,
            RunOutcome::Faulted {
                recoverable: false,
                ..
            }
        ));
        assert!(handles.status.snapshot().last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_fetch_is_no_data() {
        let harness = Harness::new();
        let a = harness.post("a", 10);
        harness.platform.fail_reads(1);
        let journal = Arc::new(Journal::default());

        let (task, handles, _tx) = harness.spawn(&journal, "pw");
        wait_until(|| handles.status.snapshot().cycles >= 1).await;
        assert_eq!(*journal.seen.lock(), vec![a]);

        handles.cancel.cancel();
        assert_eq!(task.await.unwrap(), RunOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands() {
        let harness = Harness::new();
        let journal = Arc::new(Journal::default());

        let (task, _handles, tx) = harness.spawn(&journal, "pw");

        let (reply, answer) = oneshot::channel();
        tx.send(BotCommand {
            instruction: "status".into(),
            reply,
        })
        .await
        .unwrap();
        assert!(answer.await.unwrap().is_ok());
        assert_eq!(*journal.commands.lock(), vec!["status".to_string()]);

        let (reply, answer) = oneshot::channel();
        tx.send(BotCommand {
            instruction: "explode".into(),
            reply,
        })
        .await
        .unwrap();
        assert!(answer.await.unwrap().is_err());
        assert!(matches!(task.await.unwrap(), RunOutcome::Faulted { .. }));
    }
}
