//! Configuration schema definitions.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use ibots_core::{Budget, Credentials, PageLimits, ResourcePolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IbotsConfig {
    /// Global settings that apply to all bots.
    #[serde(default)]
    pub global: GlobalConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bot configurations, keyed by bot id.
    #[serde(default)]
    pub bots: BTreeMap<String, BotConfig>,

    /// Shared resources, keyed by name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceConfig>,
}

impl IbotsConfig {
    /// Ids of the bots started by default.
    pub fn enabled_bots(&self) -> impl Iterator<Item = &str> {
        self.bots
            .iter()
            .filter(|(_, bot)| bot.enabled)
            .map(|(id, _)| id.as_str())
    }
}

// =============================================================================
// Global
// =============================================================================

/// Global configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Platform host or URL. A bare host is reached over HTTPS.
    #[serde(default)]
    pub endpoint: String,

    /// Delay between two poll cycles in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Entries requested per history page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Upper bound for a widened history page.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Persist after this many dispatched entries. 0 persists once per batch.
    #[serde(default)]
    pub checkpoint_batch: usize,

    /// Grace period for a cooperative stop in milliseconds.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Directory holding one checkpoint file per bot.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Retry policy for reads and logins.
    #[serde(default)]
    pub read_retry: RetryConfig,

    /// Restart policy for faulted bots.
    #[serde(default)]
    pub restart: RestartConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            checkpoint_batch: 0,
            stop_timeout_ms: default_stop_timeout_ms(),
            state_dir: default_state_dir(),
            read_retry: RetryConfig::default(),
            restart: RestartConfig::default(),
        }
    }
}

impl GlobalConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            page_size: self.page_size,
            max_page_size: self.max_page_size,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_page_size() -> usize {
    25
}

fn default_max_page_size() -> usize {
    400
}

fn default_stop_timeout_ms() -> u64 {
    10000
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

/// Retry configuration for idempotent reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_retry_initial_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Converts to core retry config.
    pub fn to_core_retry(&self) -> ibots_core::RetryConfig {
        ibots_core::RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_initial_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Supervisor restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Consecutive faults tolerated before a bot stays faulted.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Delay before the first restart in milliseconds.
    #[serde(default = "default_restart_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between restarts in milliseconds.
    #[serde(default = "default_restart_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            initial_delay_ms: default_restart_initial_delay_ms(),
            max_delay_ms: default_restart_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RestartConfig {
    /// Delay before the restart following the `faults`-th consecutive fault.
    pub fn delay_for(&self, faults: u32) -> Duration {
        ibots_core::RetryConfig {
            max_attempts: self.max_restarts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.backoff_multiplier,
        }
        .delay_for(faults)
    }
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_initial_delay_ms() -> u64 {
    1000
}

fn default_restart_max_delay_ms() -> u64 {
    60000
}

// =============================================================================
// Bots
// =============================================================================

/// Individual bot configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Registered handler name.
    pub handler: String,

    /// Platform login.
    pub username: String,

    /// Platform password.
    pub password: String,

    /// Names of the resources this bot may use.
    #[serde(default)]
    pub resources: Vec<String>,

    /// Handler-specific arguments.
    #[serde(default)]
    pub args: Value,

    /// Whether this bot is started with the orchestrator.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl BotConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.password)
    }
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("handler", &self.handler)
            .field("username", &self.username)
            .field("password", &"***")
            .field("resources", &self.resources)
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn default_enabled() -> bool {
    true
}

// =============================================================================
// Resources
// =============================================================================

/// Shared resource configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Registered resource kind.
    pub kind: String,

    /// Optional call budget.
    #[serde(default)]
    pub budget: Option<BudgetConfig>,

    /// Per-request deadline in milliseconds, including budget waits.
    #[serde(default = "default_resource_timeout_ms")]
    pub timeout_ms: u64,

    /// Resource-specific arguments.
    #[serde(default)]
    pub args: Value,
}

impl ResourceConfig {
    /// Builds the executor policy. Zero budgets are rejected by validation.
    pub fn policy(&self) -> ResourcePolicy {
        let mut policy =
            ResourcePolicy::default().with_timeout(Duration::from_millis(self.timeout_ms));
        if let Some(budget) = self.budget.as_ref().and_then(BudgetConfig::to_budget) {
            policy = policy.with_budget(budget);
        }
        policy
    }
}

fn default_resource_timeout_ms() -> u64 {
    30000
}

/// At most `calls` invocations per `period_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub calls: u32,
    pub period_ms: u64,
}

impl BudgetConfig {
    pub fn to_budget(&self) -> Option<Budget> {
        let calls = NonZeroU32::new(self.calls)?;
        if self.period_ms == 0 {
            return None;
        }
        Some(Budget::new(calls, Duration::from_millis(self.period_ms)))
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base log level.
    #[serde(default)]
    pub level: LogLevel,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Output destination.
    #[serde(default)]
    pub output: LogOutput,

    /// Log file for [`LogOutput::File`].
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Log file rotation for [`LogOutput::File`].
    #[serde(default)]
    pub rotation: LogRotation,

    /// Include thread ids.
    #[serde(default)]
    pub thread_ids: bool,

    /// Include file names and line numbers.
    #[serde(default)]
    pub file_location: bool,

    /// Span lifecycle events to log.
    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Per-target levels, e.g. `ibots_core = "debug"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,

    /// Per-bot levels, keyed by bot id.
    #[serde(default)]
    pub bots: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            file_path: None,
            rotation: LogRotation::Never,
            thread_ids: false,
            file_location: false,
            span_events: SpanEventConfig::default(),
            filters: HashMap::new(),
            bots: HashMap::new(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    #[cfg(feature = "json-log")]
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// How often the log file is rolled over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}
