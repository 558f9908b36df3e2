//! Core domain types for updaterelay.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateRelayError};

/// How far ahead of receipt an update timestamp may be before it is rejected.
pub const MAX_FUTURE_SKEW_SECS: i64 = 5 * 60;

/// Field name → value mapping carried by every update.
pub type Payload = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// The closed set of update categories accepted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Job,
    Event,
    Mentorship,
    Resource,
    Profile,
}

impl Category {
    /// Every category, in declaration order.
    pub const ALL: [Category; 5] = [
        Category::Job,
        Category::Event,
        Category::Mentorship,
        Category::Resource,
        Category::Profile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Event => "event",
            Self::Mentorship => "mentorship",
            Self::Resource => "resource",
            Self::Profile => "profile",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = UpdateRelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                UpdateRelayError::validation(format!(
                    "unknown update category '{s}', expected one of job, event, mentorship, resource, profile"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// UpdateRecord
// ---------------------------------------------------------------------------

/// A single externally-sourced update flowing through the pipeline.
///
/// Fields are only readable after construction. The serialized form is also
/// the webhook request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    category: Category,
    payload: Payload,
    /// Serialized as RFC 3339 / ISO-8601.
    timestamp: DateTime<Utc>,
    source: String,
    version: String,
}

impl UpdateRecord {
    /// Build a record stamped with the current time.
    pub fn new(
        category: Category,
        payload: Payload,
        source: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            category,
            payload,
            timestamp: Utc::now(),
            source: source.into(),
            version: version.into(),
        }
    }

    /// Replace the timestamp with one supplied by the producer.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Reject timestamps more than [`MAX_FUTURE_SKEW_SECS`] past `received_at`.
    pub fn check_timestamp(&self, received_at: DateTime<Utc>) -> Result<()> {
        let limit = received_at + TimeDelta::seconds(MAX_FUTURE_SKEW_SECS);
        if self.timestamp > limit {
            return Err(UpdateRelayError::validation(format!(
                "timestamp {} is more than {MAX_FUTURE_SKEW_SECS}s in the future",
                self.timestamp.to_rfc3339()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recovery vocabulary
// ---------------------------------------------------------------------------

/// Failure domain assigned to an error by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Database,
    Api,
    Validation,
    Authentication,
    Authorization,
    RateLimit,
    Timeout,
    Resource,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Database => "database",
            Self::Api => "api",
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Resource => "resource",
            Self::Unknown => "unknown",
        }
    }

    /// Categories that must never be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation | Self::Authentication | Self::Authorization
        )
    }

    /// Categories that say how fast a dependency may be called rather than
    /// what went wrong. Their own strategy replaces the operation's.
    pub fn paces_retries(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgently an error needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// Degraded action taken once retries are exhausted or a breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    UseCachedData,
    UseReadReplica,
    UseCachedResponse,
    QueueRequest,
    ReturnEmpty,
}

impl FallbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UseCachedData => "use_cached_data",
            Self::UseReadReplica => "use_read_replica",
            Self::UseCachedResponse => "use_cached_response",
            Self::QueueRequest => "queue_request",
            Self::ReturnEmpty => "return_empty",
        }
    }
}

impl std::fmt::Display for FallbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry/backoff/fallback policy for one error category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStrategy {
    /// Strategy name, used in logs.
    pub name: String,
    /// Retries after the initial attempt.
    pub retry_count: u32,
    /// Base delay; doubled for every subsequent retry.
    pub retry_delay: Duration,
    /// What to do when retries run out.
    pub fallback_action: FallbackAction,
}

impl RecoveryStrategy {
    pub fn new(
        name: impl Into<String>,
        retry_count: u32,
        retry_delay: Duration,
        fallback_action: FallbackAction,
    ) -> Self {
        Self {
            name: name.into(),
            retry_count,
            retry_delay,
            fallback_action,
        }
    }

    /// Built-in strategy for a category.
    pub fn default_for(category: ErrorCategory) -> Self {
        use FallbackAction::*;
        match category {
            ErrorCategory::Network => {
                Self::new("network_retry", 3, Duration::from_secs(5), UseCachedData)
            }
            ErrorCategory::Database => {
                Self::new("database_fallback", 2, Duration::from_secs(10), UseReadReplica)
            }
            ErrorCategory::Api => {
                Self::new("api_circuit_breaker", 2, Duration::from_secs(15), UseCachedResponse)
            }
            ErrorCategory::RateLimit => {
                Self::new("rate_limit_backoff", 4, Duration::from_secs(30), QueueRequest)
            }
            ErrorCategory::Timeout => {
                Self::new("timeout_retry", 3, Duration::from_secs(5), UseCachedData)
            }
            ErrorCategory::Resource => {
                Self::new("resource_retry", 1, Duration::from_secs(5), ReturnEmpty)
            }
            // Validation and security errors never reach a strategy.
            ErrorCategory::Validation
            | ErrorCategory::Authentication
            | ErrorCategory::Authorization
            | ErrorCategory::Unknown => {
                Self::new("conservative_retry", 1, Duration::from_secs(5), ReturnEmpty)
            }
        }
    }

    /// Delay before retry number `retry` (1-based): `retry_delay * 2^(retry-1)`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.retry_delay.saturating_mul(1u32 << exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_payload() -> Payload {
        json!({
            "title": "Engineer",
            "company": "Acme",
            "location": "Remote",
            "description": "Build things",
        })
        .as_object()
        .cloned()
        .expect("object literal")
    }

    #[test]
    fn category_roundtrip() {
        for category in Category::ALL {
            let parsed: Category = category.as_str().parse().expect("parse category");
            assert_eq!(parsed, category);
        }
    }

    #[test]
    fn unknown_category_is_validation_error() {
        let err = "internship".parse::<Category>().unwrap_err();
        assert!(matches!(err, UpdateRelayError::Validation { .. }));
        assert!("Job".parse::<Category>().is_err());
    }

    #[test]
    fn record_serializes_with_iso_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .expect("rfc3339")
            .with_timezone(&Utc);
        let record = UpdateRecord::new(Category::Job, job_payload(), "api1", "v1").with_timestamp(ts);

        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["category"], "job");
        assert_eq!(value["source"], "api1");
        assert_eq!(value["version"], "v1");
        assert_eq!(value["payload"]["company"], "Acme");
        assert_eq!(value["timestamp"], "2026-01-02T03:04:05Z");

        let parsed: UpdateRecord = serde_json::from_value(value).expect("deserialize");
        assert_eq!(parsed, record);
    }

    #[test]
    fn future_timestamp_rejected() {
        let now = Utc::now();
        let ok = UpdateRecord::new(Category::Event, Payload::new(), "s", "v")
            .with_timestamp(now + TimeDelta::seconds(MAX_FUTURE_SKEW_SECS - 1));
        assert!(ok.check_timestamp(now).is_ok());

        let skewed = UpdateRecord::new(Category::Event, Payload::new(), "s", "v")
            .with_timestamp(now + TimeDelta::minutes(6));
        assert!(skewed.check_timestamp(now).is_err());

        let past = UpdateRecord::new(Category::Event, Payload::new(), "s", "v")
            .with_timestamp(now - TimeDelta::days(30));
        assert!(past.check_timestamp(now).is_ok());
    }

    #[test]
    fn default_strategies_match_table() {
        let network = RecoveryStrategy::default_for(ErrorCategory::Network);
        assert_eq!(network.retry_count, 3);
        assert_eq!(network.retry_delay, Duration::from_secs(5));
        assert_eq!(network.fallback_action, FallbackAction::UseCachedData);

        let db = RecoveryStrategy::default_for(ErrorCategory::Database);
        assert_eq!((db.retry_count, db.fallback_action), (2, FallbackAction::UseReadReplica));

        let api = RecoveryStrategy::default_for(ErrorCategory::Api);
        assert_eq!(api.retry_delay, Duration::from_secs(15));
        assert_eq!(api.fallback_action, FallbackAction::UseCachedResponse);

        let rl = RecoveryStrategy::default_for(ErrorCategory::RateLimit);
        assert_eq!((rl.retry_count, rl.fallback_action), (4, FallbackAction::QueueRequest));
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let s = RecoveryStrategy::new("t", 4, Duration::from_millis(100), FallbackAction::ReturnEmpty);
        assert_eq!(s.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(s.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(s.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(s.backoff_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn security_and_validation_not_retryable() {
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::Authentication.is_retryable());
        assert!(!ErrorCategory::Authorization.is_retryable());
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::Unknown.is_retryable());
    }

    #[test]
    fn only_pacing_categories_replace_the_domain_strategy() {
        assert!(ErrorCategory::RateLimit.paces_retries());
        assert!(ErrorCategory::Timeout.paces_retries());
        assert!(!ErrorCategory::Api.paces_retries());
        assert!(!ErrorCategory::Network.paces_retries());
    }
}
