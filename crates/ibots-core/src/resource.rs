//! Shared resources and their serialized executors.
//!
//! A resource is a piece of mutable state shared by many bots (a ledger, a
//! game table, a third-party API key). The [`ResourceManager`] owns every
//! resource exclusively: each one is moved into its own executor task and
//! bots only ever hold a [`ResourceHandle`], which sends requests to that task.
//!
//! ```text
//! bot A ──┐                ┌─────────────────────────┐
//!         ├─▶ mpsc queue ─▶│ executor: budget → call │──▶ resource state
//! bot B ──┘                └─────────────────────────┘
//! ```
//!
//! One request runs at a time per resource, so concurrent invokes are
//! linearized without any lock held across bots. Resources never block each
//! other.
//!
//! # Budgets and timeouts
//!
//! A resource may carry a call budget (`calls` per `period`). The executor
//! waits for budget before running a request, bounded by the request's
//! deadline. A request whose caller has timed out or gone away is skipped,
//! never executed late.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::{ResourceError, ResourceResult};

/// Queue depth of each resource executor.
const QUEUE_CAPACITY: usize = 64;

/// A shared, stateful capability.
///
/// Implementations get `&mut self`: the executor guarantees exclusive access.
#[async_trait]
pub trait Resource: Send + 'static {
    /// Runs `operation` with JSON `args`.
    async fn invoke(&mut self, operation: &str, args: Value) -> ResourceResult<Value>;

    /// Handles an operator instruction. Ignored by default.
    async fn command(&mut self, instruction: &str) -> ResourceResult<Value> {
        debug!(instruction, "Resource ignores commands");
        Ok(Value::Null)
    }
}

/// A boxed resource.
pub type BoxedResource = Box<dyn Resource>;

/// A resource that can be built by kind name from configuration.
pub trait ConfigurableResource: Resource + Sized {
    /// Typed `args` from the resource's config entry.
    type Args: DeserializeOwned + Default;

    /// The name used in the `kind` field of the config.
    fn kind() -> &'static str;

    /// Builds the resource registered under `name`.
    fn from_args(name: &str, args: Self::Args) -> ResourceResult<Self>;
}

/// A call budget: at most `calls` invocations in any window of `period`.
///
/// Calls are spaced evenly, `period / calls` apart. There is no burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub calls: NonZeroU32,
    pub period: Duration,
}

impl Budget {
    pub fn new(calls: NonZeroU32, period: Duration) -> Self {
        Self { calls, period }
    }

    /// One cell every `period / calls`, rounded up, with a burst of one.
    fn quota(&self) -> Option<Quota> {
        let nanos = self.period.as_nanos().div_ceil(u128::from(self.calls.get()));
        Quota::with_period(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

/// Access policy for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePolicy {
    pub budget: Option<Budget>,
    /// How long an invoke may wait for the queue and the budget.
    pub timeout: Duration,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            budget: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ResourcePolicy {
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// =============================================================================
// Requests
// =============================================================================

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides, exactly once, whether a request runs or is abandoned.
#[derive(Debug, Default)]
struct Ticket(AtomicU8);

impl Ticket {
    fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire) == PENDING
    }

    fn start(&self) -> bool {
        self.0
            .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns false if the request already started.
    fn abandon(&self) -> bool {
        match self
            .0
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state == ABANDONED,
        }
    }
}

/// Abandons the ticket if the caller's future is dropped.
struct TicketGuard(Arc<Ticket>);

impl Drop for TicketGuard {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

enum Request {
    Invoke {
        operation: String,
        args: Value,
        deadline: Instant,
        ticket: Arc<Ticket>,
        reply: oneshot::Sender<ResourceResult<Value>>,
    },
    Command {
        instruction: String,
        reply: oneshot::Sender<ResourceResult<Value>>,
    },
}

// =============================================================================
// Handle
// =============================================================================

/// A capability to use one resource.
///
/// Cheap to clone. Never exposes the resource's state.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Request>,
    timeout: Duration,
}

impl ResourceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `operation` on the resource.
    ///
    /// Waits for earlier requests and for budget, at most the resource's
    /// timeout. On [`ResourceError::Timeout`] the operation has not run and
    /// never will.
    pub async fn invoke(&self, operation: &str, args: Value) -> ResourceResult<Value> {
        let deadline = Instant::now() + self.timeout;
        let ticket = Arc::new(Ticket::default());
        let guard = TicketGuard(ticket.clone());
        let (reply_tx, mut reply_rx) = oneshot::channel();

        let request = Request::Invoke {
            operation: operation.to_string(),
            args,
            deadline,
            ticket,
            reply: reply_tx,
        };
        match tokio::time::timeout_at(deadline, self.tx.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(self.unavailable()),
            Err(_) => return Err(self.timed_out()),
        }

        match tokio::time::timeout_at(deadline, &mut reply_rx).await {
            Ok(reply) => reply.unwrap_or_else(|_| Err(self.unavailable())),
            Err(_) if guard.0.abandon() => {
                debug!(resource = %self.name, operation, "Invoke timed out before it started");
                Err(self.timed_out())
            }
            // Already running: its outcome must be reported.
            Err(_) => reply_rx.await.unwrap_or_else(|_| Err(self.unavailable())),
        }
    }

    /// Sends an operator instruction to the resource.
    pub async fn command(&self, instruction: &str) -> ResourceResult<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request::Command {
            instruction: instruction.to_string(),
            reply: reply_tx,
        };
        self.tx.send(request).await.map_err(|_| self.unavailable())?;
        reply_rx.await.unwrap_or_else(|_| Err(self.unavailable()))
    }

    fn unavailable(&self) -> ResourceError {
        ResourceError::Unavailable {
            name: self.name.to_string(),
        }
    }

    fn timed_out(&self) -> ResourceError {
        ResourceError::Timeout {
            name: self.name.to_string(),
            waited: self.timeout,
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct Executor {
    name: Arc<str>,
    resource: BoxedResource,
    limiter: Option<DirectLimiter>,
    timeout: Duration,
    rx: mpsc::Receiver<Request>,
    shutdown: CancellationToken,
}

impl Executor {
    async fn run(mut self) {
        debug!("Resource executor started");
        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            match request {
                Request::Invoke {
                    operation,
                    args,
                    deadline,
                    ticket,
                    reply,
                } => self.invoke(operation, args, deadline, ticket, reply).await,
                Request::Command { instruction, reply } => {
                    info!(instruction = %instruction, "Resource command");
                    let result = self.resource.command(&instruction).await;
                    let _ = reply.send(result);
                }
            }
        }
        debug!("Resource executor stopped");
    }

    async fn invoke(
        &mut self,
        operation: String,
        args: Value,
        deadline: Instant,
        ticket: Arc<Ticket>,
        reply: oneshot::Sender<ResourceResult<Value>>,
    ) {
        if !ticket.is_pending() || reply.is_closed() {
            debug!(operation = %operation, "Skipping abandoned request");
            return;
        }

        if let Some(limiter) = &self.limiter {
            if tokio::time::timeout_at(deadline, limiter.until_ready()).await.is_err() {
                if ticket.abandon() {
                    debug!(operation = %operation, "Budget not available before deadline");
                    let _ = reply.send(Err(ResourceError::Timeout {
                        name: self.name.to_string(),
                        waited: self.timeout,
                    }));
                }
                return;
            }
        }

        if !ticket.start() {
            debug!(operation = %operation, "Caller gave up while waiting for budget");
            return;
        }

        let result = self.resource.invoke(&operation, args).await;
        if let Err(e) = &result {
            warn!(operation = %operation, error = %e, "Resource operation failed");
        }
        let _ = reply.send(result);
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Owns all shared resources.
pub struct ResourceManager {
    handles: RwLock<HashMap<String, ResourceHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Takes ownership of `resource` and starts its executor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        &self,
        name: impl Into<String>,
        resource: BoxedResource,
        policy: ResourcePolicy,
    ) -> ResourceResult<()> {
        let name = name.into();
        let mut handles = self.handles.write();
        if handles.contains_key(&name) {
            return Err(ResourceError::failed(name, "already registered"));
        }

        let limiter = match policy.budget {
            Some(budget) => Some(RateLimiter::direct(budget.quota().ok_or_else(|| {
                ResourceError::failed(name.clone(), "budget period must be positive")
            })?)),
            None => None,
        };

        let shared_name: Arc<str> = Arc::from(name.as_str());
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let executor = Executor {
            name: shared_name.clone(),
            resource,
            limiter,
            timeout: policy.timeout,
            rx,
            shutdown: self.shutdown.child_token(),
        };

        let span = info_span!("resource", resource = %name);
        self.tasks.lock().push(tokio::spawn(executor.run().instrument(span)));

        info!(
            resource = %name,
            budget = ?policy.budget,
            timeout = ?policy.timeout,
            "Registered resource"
        );
        handles.insert(
            name,
            ResourceHandle {
                name: shared_name,
                tx,
                timeout: policy.timeout,
            },
        );
        Ok(())
    }

    /// Returns a handle, failing fast for unknown names.
    pub fn acquire(&self, name: &str) -> ResourceResult<ResourceHandle> {
        self.handles
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ResourceError::UnknownResource {
                name: name.to_string(),
            })
    }

    /// Returns a handle if `name` is among `grants`.
    pub fn acquire_for(
        &self,
        bot_id: &str,
        name: &str,
        grants: &[String],
    ) -> ResourceResult<ResourceHandle> {
        let handle = self.acquire(name)?;
        if !grants.iter().any(|g| g == name) {
            return Err(ResourceError::NotGranted {
                name: name.to_string(),
                bot_id: bot_id.to_string(),
            });
        }
        Ok(handle)
    }

    /// Acquires every granted resource.
    pub fn acquire_all(
        &self,
        bot_id: &str,
        grants: &[String],
    ) -> ResourceResult<HashMap<String, ResourceHandle>> {
        grants
            .iter()
            .map(|name| Ok((name.clone(), self.acquire_for(bot_id, name, grants)?)))
            .collect()
    }

    /// Sends an operator instruction to `name`.
    pub async fn command(&self, name: &str, instruction: &str) -> ResourceResult<Value> {
        self.acquire(name)?.command(instruction).await
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handles.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    /// Stops every executor. Pending requests fail with `Unavailable`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Resource executor ended abnormally");
            }
        }
        self.handles.write().clear();
        info!("Resource manager stopped");
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("resources", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Read-modify-write across an await point: breaks without serialization.
    struct Counter {
        value: i64,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        calls: Arc<Mutex<Vec<std::time::Instant>>>,
    }

    impl Counter {
        fn new() -> Self {
            Self {
                value: 0,
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Resource for Counter {
        async fn invoke(&mut self, operation: &str, _args: Value) -> ResourceResult<Value> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().push(std::time::Instant::now());

            let result = match operation {
                "increment" => {
                    let current = self.value;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    self.value = current + 1;
                    Ok(json!(self.value))
                }
                "get" => Ok(json!(self.value)),
                other => Err(ResourceError::unsupported("counter", other)),
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn command(&mut self, instruction: &str) -> ResourceResult<Value> {
            if instruction == "reset" {
                self.value = 0;
            }
            Ok(json!(self.value))
        }
    }

    #[tokio::test]
    async fn test_concurrent_invokes_are_serialized() {
        let manager = ResourceManager::new();
        let counter = Counter::new();
        let max_in_flight = counter.max_in_flight.clone();
        manager
            .register("counter", Box::new(counter), ResourcePolicy::default())
            .unwrap();

        let handle = manager.acquire("counter").unwrap();
        let calls = (0..20).map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.invoke("increment", Value::Null).await })
        });
        for call in calls.collect::<Vec<_>>() {
            call.await.unwrap().unwrap();
        }

        assert_eq!(handle.invoke("get", Value::Null).await.unwrap(), json!(20));
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_budget_spaces_calls_across_bots() {
        let manager = ResourceManager::new();
        let counter = Counter::new();
        let calls = counter.calls.clone();
        let budget = Budget::new(NonZeroU32::new(1).unwrap(), Duration::from_millis(300));
        manager
            .register(
                "ledger",
                Box::new(counter),
                ResourcePolicy::default()
                    .with_budget(budget)
                    .with_timeout(Duration::from_secs(5)),
            )
            .unwrap();

        let grants = vec!["ledger".to_string()];
        let bot_a = manager.acquire_for("a", "ledger", &grants).unwrap();
        let bot_b = manager.acquire_for("b", "ledger", &grants).unwrap();
        let (ra, rb) = tokio::join!(
            bot_a.invoke("increment", Value::Null),
            bot_b.invoke("increment", Value::Null)
        );
        ra.unwrap();
        rb.unwrap();

        let calls = calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= Duration::from_millis(250));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_budget_never_exceeds_calls_per_period() {
        let manager = ResourceManager::new();
        let counter = Counter::new();
        let calls = counter.calls.clone();
        let budget = Budget::new(NonZeroU32::new(2).unwrap(), Duration::from_millis(600));
        manager
            .register(
                "ledger",
                Box::new(counter),
                ResourcePolicy::default()
                    .with_budget(budget)
                    .with_timeout(Duration::from_secs(5)),
            )
            .unwrap();

        let handle = manager.acquire("ledger").unwrap();
        for _ in 0..4 {
            handle.invoke("get", Value::Null).await.unwrap();
        }

        let calls = calls.lock().clone();
        assert_eq!(calls.len(), 4);
        for window in calls.windows(3) {
            assert!(
                window[2] - window[0] >= Duration::from_millis(550),
                "three calls inside one period: {:?}",
                window[2] - window[0]
            );
        }
        manager.shutdown().await;
    }

    #[test]
    fn test_budget_quota_has_no_burst() {
        let budget = Budget::new(NonZeroU32::new(3).unwrap(), Duration::from_secs(1));
        let quota = budget.quota().unwrap();
        assert_eq!(quota.burst_size().get(), 1);
        assert!(quota.replenish_interval() * 3 >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_timed_out_request_never_runs() {
        let manager = ResourceManager::new();
        let counter = Counter::new();
        let calls = counter.calls.clone();
        let budget = Budget::new(NonZeroU32::new(1).unwrap(), Duration::from_secs(60));
        manager
            .register(
                "ledger",
                Box::new(counter),
                ResourcePolicy::default()
                    .with_budget(budget)
                    .with_timeout(Duration::from_millis(100)),
            )
            .unwrap();

        let handle = manager.acquire("ledger").unwrap();
        handle.invoke("increment", Value::Null).await.unwrap();
        let err = handle.invoke("increment", Value::Null).await.unwrap_err();
        assert!(matches!(err, ResourceError::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.lock().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_checks_names_and_grants() {
        let manager = ResourceManager::new();
        manager
            .register("counter", Box::new(Counter::new()), ResourcePolicy::default())
            .unwrap();

        assert!(matches!(
            manager.acquire("missing").unwrap_err(),
            ResourceError::UnknownResource { .. }
        ));
        assert!(matches!(
            manager.acquire_for("bot", "counter", &[]).unwrap_err(),
            ResourceError::NotGranted { .. }
        ));
        assert!(
            manager
                .register("counter", Box::new(Counter::new()), ResourcePolicy::default())
                .is_err()
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_command_and_shutdown() {
        let manager = ResourceManager::new();
        manager
            .register("counter", Box::new(Counter::new()), ResourcePolicy::default())
            .unwrap();
        let handle = manager.acquire("counter").unwrap();
        handle.invoke("increment", Value::Null).await.unwrap();

        assert_eq!(manager.command("counter", "reset").await.unwrap(), json!(0));

        manager.shutdown().await;
        assert!(matches!(
            handle.invoke("get", Value::Null).await.unwrap_err(),
            ResourceError::Unavailable { .. }
        ));
    }
}
