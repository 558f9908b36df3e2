//! Application configuration for updaterelay.
//!
//! User config lives at `~/.updaterelay/updaterelay.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateRelayError};
use crate::types::{Category, ErrorCategory, FallbackAction, RecoveryStrategy};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "updaterelay.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".updaterelay";

// ---------------------------------------------------------------------------
// Config structs (matching updaterelay.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Dual cache sizing and freshness.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Update queue backpressure.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Circuit breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Outbound webhook delivery.
    #[serde(default)]
    pub webhooks: WebhooksConfig,

    /// Error history retention.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Per-category recovery strategy overrides.
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Webhook subscriptions registered at startup.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Freshness window for the TTL tier.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Maximum entries held by the TTL tier.
    #[serde(default = "default_ttl_capacity")]
    pub ttl_capacity: usize,

    /// Maximum entries held by the recency (LRU) tier.
    #[serde(default = "default_recency_capacity")]
    pub recency_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            ttl_capacity: default_ttl_capacity(),
            recency_capacity: default_recency_capacity(),
        }
    }
}

fn default_ttl_seconds() -> u64 {
    3600
}
fn default_ttl_capacity() -> usize {
    1000
}
fn default_recency_capacity() -> usize {
    500
}

/// `[queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Bound on queued, not-yet-processed updates.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// How long `enqueue` waits for room before reporting rejection.
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    /// Concurrent webhook delivery tasks the processor keeps in flight.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_deliveries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            max_in_flight_deliveries: default_max_in_flight(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}
fn default_enqueue_timeout_ms() -> u64 {
    1000
}
fn default_max_in_flight() -> usize {
    64
}

/// `[breaker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before a breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,

    /// Cool-down before an open breaker lets a probe through.
    #[serde(default = "default_reset_timeout_seconds")]
    pub reset_timeout_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            reset_timeout_seconds: default_reset_timeout_seconds(),
        }
    }
}

fn default_breaker_threshold() -> u32 {
    5
}
fn default_reset_timeout_seconds() -> u64 {
    60
}

/// `[webhooks]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    /// Per-attempt delivery timeout.
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,

    /// Permit loopback/private subscriber URLs (local development only).
    #[serde(default)]
    pub allow_private_targets: bool,

    /// Deliveries parked by the `queue_request` fallback.
    #[serde(default = "default_deferred_capacity")]
    pub deferred_capacity: usize,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_webhook_timeout(),
            allow_private_targets: false,
            deferred_capacity: default_deferred_capacity(),
        }
    }
}

fn default_webhook_timeout() -> u64 {
    5
}
fn default_deferred_capacity() -> usize {
    256
}

/// `[history]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Entries older than this are pruned on insert.
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,

    /// Hard cap on retained entries (oldest dropped first).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_seconds: default_retention_seconds(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_retention_seconds() -> u64 {
    24 * 60 * 60
}
fn default_max_entries() -> usize {
    10_000
}

/// `[recovery.<category>]` override. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_action: Option<FallbackAction>,
}

impl StrategyOverride {
    fn apply(&self, mut base: RecoveryStrategy) -> RecoveryStrategy {
        if let Some(count) = self.retry_count {
            base.retry_count = count;
        }
        if let Some(ms) = self.retry_delay_ms {
            base.retry_delay = Duration::from_millis(ms);
        }
        if let Some(action) = self.fallback_action {
            base.fallback_action = action;
        }
        base
    }
}

/// `[recovery]` section: one optional table per retryable category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<StrategyOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<StrategyOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<StrategyOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<StrategyOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<StrategyOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<StrategyOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown: Option<StrategyOverride>,
}

impl RecoveryConfig {
    fn override_for(&self, category: ErrorCategory) -> Option<&StrategyOverride> {
        match category {
            ErrorCategory::Network => self.network.as_ref(),
            ErrorCategory::Database => self.database.as_ref(),
            ErrorCategory::Api => self.api.as_ref(),
            ErrorCategory::RateLimit => self.rate_limit.as_ref(),
            ErrorCategory::Timeout => self.timeout.as_ref(),
            ErrorCategory::Resource => self.resource.as_ref(),
            ErrorCategory::Unknown => self.unknown.as_ref(),
            _ => None,
        }
    }

    /// Built-in strategies with any configured overrides applied.
    pub fn strategies(&self) -> BTreeMap<ErrorCategory, RecoveryStrategy> {
        [
            ErrorCategory::Network,
            ErrorCategory::Database,
            ErrorCategory::Api,
            ErrorCategory::RateLimit,
            ErrorCategory::Timeout,
            ErrorCategory::Resource,
            ErrorCategory::Unknown,
        ]
        .into_iter()
        .map(|category| {
            let base = RecoveryStrategy::default_for(category);
            let strategy = match self.override_for(category) {
                Some(over) => over.apply(base),
                None => base,
            };
            (category, strategy)
        })
        .collect()
    }
}

/// `[[subscriptions]]` entry, a webhook registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    /// Category the subscriber is interested in.
    pub category: Category,
    /// Endpoint receiving JSON POSTs.
    pub url: String,
}

impl AppConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(UpdateRelayError::config("queue.capacity must be at least 1"));
        }
        if self.queue.max_in_flight_deliveries == 0 {
            return Err(UpdateRelayError::config(
                "queue.max_in_flight_deliveries must be at least 1",
            ));
        }
        if self.breaker.threshold == 0 {
            return Err(UpdateRelayError::config("breaker.threshold must be at least 1"));
        }
        if self.cache.ttl_seconds == 0 {
            return Err(UpdateRelayError::config("cache.ttl_seconds must be positive"));
        }
        if self.webhooks.timeout_seconds == 0 {
            return Err(UpdateRelayError::config(
                "webhooks.timeout_seconds must be positive",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from config file and CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Default TTL for cache writes.
    pub ttl: Duration,
    /// TTL tier bound.
    pub ttl_capacity: usize,
    /// Recency tier bound.
    pub recency_capacity: usize,
    /// Queue bound (always ≥ 1).
    pub queue_capacity: usize,
    /// Maximum wait when the queue is full.
    pub enqueue_timeout: Duration,
    /// Delivery tasks kept in flight by the processor (always ≥ 1).
    pub max_in_flight_deliveries: usize,
    /// Failures before a breaker opens.
    pub breaker_threshold: u32,
    /// Breaker cool-down.
    pub breaker_reset_timeout: Duration,
    /// Per-attempt webhook timeout.
    pub webhook_timeout: Duration,
    /// Allow loopback/private webhook targets.
    pub allow_private_targets: bool,
    /// Deferred-delivery bound.
    pub deferred_capacity: usize,
    /// Error history retention window.
    pub history_retention: Duration,
    /// Error history cap.
    pub history_max_entries: usize,
    /// Recovery strategy per error category.
    pub strategies: BTreeMap<ErrorCategory, RecoveryStrategy>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.cache.ttl_seconds),
            ttl_capacity: config.cache.ttl_capacity,
            recency_capacity: config.cache.recency_capacity,
            queue_capacity: config.queue.capacity.max(1),
            enqueue_timeout: Duration::from_millis(config.queue.enqueue_timeout_ms),
            max_in_flight_deliveries: config.queue.max_in_flight_deliveries.max(1),
            breaker_threshold: config.breaker.threshold,
            breaker_reset_timeout: Duration::from_secs(config.breaker.reset_timeout_seconds),
            webhook_timeout: Duration::from_secs(config.webhooks.timeout_seconds),
            allow_private_targets: config.webhooks.allow_private_targets,
            deferred_capacity: config.webhooks.deferred_capacity,
            history_retention: Duration::from_secs(config.history.retention_seconds),
            history_max_entries: config.history.max_entries,
            strategies: config.recovery.strategies(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.updaterelay/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| UpdateRelayError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.updaterelay/updaterelay.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| UpdateRelayError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        UpdateRelayError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| UpdateRelayError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| UpdateRelayError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| UpdateRelayError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
