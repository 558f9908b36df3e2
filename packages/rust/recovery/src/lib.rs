//! Error recovery for the update pipeline.
//!
//! This crate provides:
//! - [`classify`]: maps an [`UpdateRelayError`](updaterelay_shared::UpdateRelayError)
//!   to a category and severity
//! - [`BreakerTable`]: one circuit breaker per `(domain, source)`
//! - [`ErrorHistory`]: bounded log of classified failures
//! - [`RecoveryExecutor`]: retry with exponential backoff, breaker gating,
//!   and strategy fallbacks

pub mod breaker;
pub mod classify;
pub mod executor;
pub mod history;

pub use breaker::{BreakerKey, BreakerSnapshot, BreakerState, BreakerTable, CircuitBreaker};
pub use classify::{Classification, classify};
pub use executor::{Operation, Recovery, RecoveryExecutor};
pub use history::{ErrorContext, ErrorHistory};
