//! Shared types, error model, and configuration for updaterelay.
//!
//! This crate is the foundation depended on by all other updaterelay crates.
//! It provides:
//! - [`UpdateRelayError`]: the unified error type
//! - Domain types ([`Category`], [`UpdateRecord`], [`Payload`]) and the
//!   recovery vocabulary ([`ErrorCategory`], [`Severity`], [`FallbackAction`],
//!   [`RecoveryStrategy`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BreakerConfig, CacheConfig, HistoryConfig, PipelineConfig, QueueConfig,
    RecoveryConfig, StrategyOverride, SubscriptionEntry, WebhooksConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{Result, UpdateRelayError};
pub use types::{
    Category, ErrorCategory, FallbackAction, MAX_FUTURE_SKEW_SECS, Payload, RecoveryStrategy,
    Severity, UpdateRecord,
};
