//! Dispatcher configuration.
//!
//! [`DispatchConfig`] is the typed runtime configuration consumed by the
//! [`crate::Dispatcher`]. [`Config`] is the flat, file- and
//! environment-backed form loaded through figment and converted into the
//! runtime types.

use std::{fmt, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use spool_core::{NodeId, ReapPolicy, TableNames};

use crate::{
    error::DispatchError,
    retry::{BackoffStrategy, RetryPolicy},
};

const CONFIG_FILE: &str = "spool.toml";
const ENV_PREFIX: &str = "SPOOL_";

/// How claim cycles are triggered and which entries a node may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistentQueueMode {
    /// Timer-driven claims of any node's entries.
    #[default]
    #[serde(alias = "polling")]
    Polling,
    /// Timer-driven claims restricted to entries this node created.
    #[serde(alias = "sticky_polling")]
    StickyPolling,
    /// Commit-notification-driven claims restricted to entries this node
    /// created, with a sparse fallback poll.
    #[serde(alias = "sticky_events")]
    StickyEvents,
}

impl PersistentQueueMode {
    /// Sticky modes only claim entries created by the local node.
    pub const fn is_sticky(self) -> bool {
        matches!(self, Self::StickyPolling | Self::StickyEvents)
    }
}

impl fmt::Display for PersistentQueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polling => f.write_str("POLLING"),
            Self::StickyPolling => f.write_str("STICKY_POLLING"),
            Self::StickyEvents => f.write_str("STICKY_EVENTS"),
        }
    }
}

/// Runtime configuration for one dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Trigger strategy and claim affinity.
    pub mode: PersistentQueueMode,
    /// Entries requested per claim cycle.
    pub max_entries_claimed: usize,
    /// Claims older than this are reaped.
    pub claimed_time: Duration,
    /// Sleep between claim cycles in polling modes.
    pub polling_sleep_time: Duration,
    /// Capacity of the internal queue between the claim loop and workers.
    pub event_queue_capacity: usize,
    /// Worker pool size.
    pub max_dispatch_threads: usize,
    /// Accept appends but never claim or dispatch.
    pub is_processing_off: bool,
    /// Interval between reap cycles.
    pub reaper_interval: Duration,
    /// Fallback poll interval in `StickyEvents` mode.
    pub sticky_events_fallback: Duration,
    /// Grace period for in-flight work at shutdown.
    pub shutdown_timeout: Duration,
    /// Count a reap as a failed attempt.
    pub penalize_reaped: bool,
    /// Retry policy applied to handler failures.
    pub retry_policy: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: PersistentQueueMode::Polling,
            max_entries_claimed: crate::DEFAULT_MAX_ENTRIES_CLAIMED,
            claimed_time: Duration::from_secs(300),
            polling_sleep_time: Duration::from_secs(1),
            event_queue_capacity: crate::DEFAULT_EVENT_QUEUE_CAPACITY,
            max_dispatch_threads: crate::DEFAULT_DISPATCH_THREADS,
            is_processing_off: false,
            reaper_interval: Duration::from_secs(30),
            sticky_events_fallback: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            penalize_reaped: false,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    /// Reap parameters derived from this configuration.
    pub fn reap_policy(&self) -> ReapPolicy {
        ReapPolicy {
            claim_timeout: self.claimed_time,
            max_failure_retries: self.retry_policy.max_failure_retries,
            penalize: self.penalize_reaped,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` describing the first invalid
    /// value.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_dispatch_threads == 0 {
            return Err(DispatchError::configuration("max_dispatch_threads must be greater than 0"));
        }
        if self.max_entries_claimed == 0 {
            return Err(DispatchError::configuration("max_entries_claimed must be greater than 0"));
        }
        if self.event_queue_capacity < self.max_entries_claimed {
            return Err(DispatchError::configuration(
                "event_queue_capacity must be at least max_entries_claimed",
            ));
        }
        if self.claimed_time.is_zero() {
            return Err(DispatchError::configuration("claimed_time must be greater than 0"));
        }
        if self.polling_sleep_time.is_zero()
            || self.reaper_interval.is_zero()
            || self.sticky_events_fallback.is_zero()
        {
            return Err(DispatchError::configuration("loop intervals must be greater than 0"));
        }
        self.retry_policy.validate()
    }
}

/// Complete node configuration with defaults, file, and environment
/// overrides.
///
/// Loaded in priority order:
/// 1. `SPOOL_`-prefixed environment variables (e.g. `SPOOL_MODE`)
/// 2. Unprefixed `DATABASE_URL` and `RUST_LOG`
/// 3. Configuration file (`spool.toml`)
/// 4. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Dispatch
    /// Trigger strategy and claim affinity.
    #[serde(default)]
    pub mode: PersistentQueueMode,
    /// Failed attempts after which an entry becomes `FAILED`.
    #[serde(default = "default_max_failure_retries")]
    pub max_failure_retries: u32,
    /// Entries requested per claim cycle.
    #[serde(default = "default_max_entries_claimed")]
    pub max_entries_claimed: usize,
    /// Claim age in milliseconds after which an entry is reaped.
    #[serde(default = "default_claimed_time_ms")]
    pub claimed_time_ms: u64,
    /// Sleep between claim cycles in milliseconds.
    #[serde(default = "default_polling_sleep_time_ms")]
    pub polling_sleep_time_ms: u64,
    /// Capacity of the internal work queue.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Worker pool size.
    #[serde(default = "default_max_dispatch_threads")]
    pub max_dispatch_threads: usize,
    /// Accept appends but never dispatch.
    #[serde(default)]
    pub is_processing_off: bool,
    /// Interval between reap cycles in milliseconds.
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
    /// Fallback poll interval in `STICKY_EVENTS` mode, in milliseconds.
    #[serde(default = "default_sticky_events_fallback_ms")]
    pub sticky_events_fallback_ms: u64,
    /// Shutdown grace period in milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Count a reap as a failed attempt.
    #[serde(default)]
    pub penalize_reaped: bool,

    // Retry
    /// Delay after the first failure in milliseconds.
    #[serde(default = "default_retry_base_backoff_ms")]
    pub retry_base_backoff_ms: u64,
    /// Upper bound on retry delays in milliseconds.
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    /// Upward jitter fraction (0.0 to 1.0).
    #[serde(default = "default_retry_jitter_factor")]
    pub retry_jitter_factor: f64,
    /// Shape of the retry delay curve.
    #[serde(default = "default_backoff_strategy")]
    pub retry_backoff_strategy: BackoffStrategy,

    // Storage
    /// Table holding live entries.
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Table receiving purged entries.
    #[serde(default = "default_history_table_name")]
    pub history_table_name: String,
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum pooled connections.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    // Identity and logging
    /// Fixed node identity; generated from host and pid when unset.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Log filter directive.
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `spool.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or the result fails
    /// validation.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::raw().only(&["DATABASE_URL", "RUST_LOG"]))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    /// Extracts and validates configuration from an arbitrary figment.
    ///
    /// # Errors
    ///
    /// Returns error if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts into the dispatcher's runtime configuration.
    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            mode: self.mode,
            max_entries_claimed: self.max_entries_claimed,
            claimed_time: Duration::from_millis(self.claimed_time_ms),
            polling_sleep_time: Duration::from_millis(self.polling_sleep_time_ms),
            event_queue_capacity: self.event_queue_capacity,
            max_dispatch_threads: self.max_dispatch_threads,
            is_processing_off: self.is_processing_off,
            reaper_interval: Duration::from_millis(self.reaper_interval_ms),
            sticky_events_fallback: Duration::from_millis(self.sticky_events_fallback_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            penalize_reaped: self.penalize_reaped,
            retry_policy: self.to_retry_policy(),
        }
    }

    /// Converts into the retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_failure_retries: self.max_failure_retries,
            base_backoff: Duration::from_millis(self.retry_base_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: self.retry_backoff_strategy,
        }
    }

    /// Storage table names.
    pub fn table_names(&self) -> TableNames {
        TableNames { table: self.table_name.clone(), history: self.history_table_name.clone() }
    }

    /// Configured node identity, or a freshly generated one.
    pub fn node_id(&self) -> NodeId {
        self.node_id.as_deref().map_or_else(NodeId::generate, NodeId::new)
    }

    /// Database URL safe to log: the password of the userinfo part is
    /// replaced with `***`.
    pub fn redacted_database_url(&self) -> String {
        let url = self.database_url.as_str();
        let Some((scheme, rest)) = url.split_once("://") else {
            return url.to_string();
        };
        let Some((userinfo, host)) = rest.rsplit_once('@') else {
            return url.to_string();
        };
        match userinfo.split_once(':') {
            Some((user, _password)) => format!("{scheme}://{user}:***@{host}"),
            None => url.to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }
        if self.node_id.as_deref().is_some_and(str::is_empty) {
            anyhow::bail!("node_id cannot be empty");
        }
        self.table_names().validate()?;
        self.to_dispatch_config().validate()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: PersistentQueueMode::default(),
            max_failure_retries: default_max_failure_retries(),
            max_entries_claimed: default_max_entries_claimed(),
            claimed_time_ms: default_claimed_time_ms(),
            polling_sleep_time_ms: default_polling_sleep_time_ms(),
            event_queue_capacity: default_event_queue_capacity(),
            max_dispatch_threads: default_max_dispatch_threads(),
            is_processing_off: false,
            reaper_interval_ms: default_reaper_interval_ms(),
            sticky_events_fallback_ms: default_sticky_events_fallback_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            penalize_reaped: false,
            retry_base_backoff_ms: default_retry_base_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            retry_jitter_factor: default_retry_jitter_factor(),
            retry_backoff_strategy: default_backoff_strategy(),
            table_name: default_table_name(),
            history_table_name: default_history_table_name(),
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            node_id: None,
            rust_log: default_log_level(),
        }
    }
}

fn default_max_failure_retries() -> u32 {
    5
}

fn default_max_entries_claimed() -> usize {
    crate::DEFAULT_MAX_ENTRIES_CLAIMED
}

fn default_claimed_time_ms() -> u64 {
    300_000
}

fn default_polling_sleep_time_ms() -> u64 {
    1_000
}

fn default_event_queue_capacity() -> usize {
    crate::DEFAULT_EVENT_QUEUE_CAPACITY
}

fn default_max_dispatch_threads() -> usize {
    crate::DEFAULT_DISPATCH_THREADS
}

fn default_reaper_interval_ms() -> u64 {
    30_000
}

fn default_sticky_events_fallback_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_retry_base_backoff_ms() -> u64 {
    1_000
}

fn default_retry_max_backoff_ms() -> u64 {
    300_000
}

fn default_retry_jitter_factor() -> f64 {
    0.1
}

fn default_backoff_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_table_name() -> String {
    spool_core::DEFAULT_TABLE_NAME.to_string()
}

fn default_history_table_name() -> String {
    spool_core::DEFAULT_HISTORY_TABLE_NAME.to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost/spool".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}
