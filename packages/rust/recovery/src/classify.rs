//! Error classification: [`UpdateRelayError`] → (category, severity).
//!
//! Typed variants map directly. `Other` carries only a message, so it is
//! matched against an ordered pattern list; the first match wins and anything
//! unmatched is `unknown`/`medium`.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use updaterelay_shared::{ErrorCategory, Severity, UpdateRelayError};

/// Result of classifying one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: Severity,
}

impl Classification {
    const fn new(category: ErrorCategory, severity: Severity) -> Self {
        Self { category, severity }
    }

    const UNKNOWN: Self = Self::new(ErrorCategory::Unknown, Severity::Medium);
}

/// Map an error to its category and severity.
pub fn classify(error: &UpdateRelayError) -> Classification {
    use ErrorCategory as C;
    use Severity as S;

    match error {
        UpdateRelayError::Network(_) => Classification::new(C::Network, S::High),
        UpdateRelayError::Timeout(_) => Classification::new(C::Timeout, S::High),
        UpdateRelayError::Http { status, .. } => classify_status(*status),
        UpdateRelayError::Storage(_) => Classification::new(C::Database, S::High),
        UpdateRelayError::Validation { .. }
        | UpdateRelayError::Parse { .. }
        | UpdateRelayError::Config { .. } => Classification::new(C::Validation, S::Medium),
        UpdateRelayError::Authentication { .. } => {
            Classification::new(C::Authentication, S::Critical)
        }
        UpdateRelayError::Authorization { .. } => {
            Classification::new(C::Authorization, S::Critical)
        }
        UpdateRelayError::RateLimited(_) => Classification::new(C::RateLimit, S::Low),
        UpdateRelayError::Resource(_)
        | UpdateRelayError::QueueClosed
        | UpdateRelayError::Io { .. } => Classification::new(C::Resource, S::High),
        UpdateRelayError::Other(message) => classify_message(message),
    }
}

fn classify_status(status: u16) -> Classification {
    use ErrorCategory as C;
    use Severity as S;

    match status {
        401 => Classification::new(C::Authentication, S::Critical),
        403 => Classification::new(C::Authorization, S::Critical),
        429 => Classification::new(C::RateLimit, S::Low),
        408 | 504 => Classification::new(C::Timeout, S::High),
        _ => Classification::new(C::Api, S::Medium),
    }
}

static MESSAGE_RULES: LazyLock<Vec<(Regex, Classification)>> = LazyLock::new(|| {
    use ErrorCategory as C;
    use Severity as S;

    [
        (
            r"(?i)\bunauthori[sz]ed\b|\bauthentication\b|invalid (api )?token|\b401\b",
            Classification::new(C::Authentication, S::Critical),
        ),
        (
            r"(?i)\bforbidden\b|permission denied|not permitted|\b403\b",
            Classification::new(C::Authorization, S::Critical),
        ),
        (
            r"(?i)timed? ?out|deadline exceeded",
            Classification::new(C::Timeout, S::High),
        ),
        (
            r"(?i)connection (refused|reset|closed|aborted)|broken pipe|dns|unreachable|no route to host",
            Classification::new(C::Network, S::High),
        ),
        (
            r"(?i)rate.?limit|too many requests|\b429\b|quota exceeded",
            Classification::new(C::RateLimit, S::Low),
        ),
        (
            r"(?i)database|\bsql\b|deadlock|replica",
            Classification::new(C::Database, S::High),
        ),
        (
            r"(?i)out of memory|no space left|too many open files|resource exhausted",
            Classification::new(C::Resource, S::High),
        ),
    ]
    .into_iter()
    .map(|(pattern, class)| (Regex::new(pattern).expect("static classifier pattern"), class))
    .collect()
});

fn classify_message(message: &str) -> Classification {
    MESSAGE_RULES
        .iter()
        .find(|(pattern, _)| pattern.is_match(message))
        .map(|(_, class)| *class)
        .unwrap_or(Classification::UNKNOWN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(error: UpdateRelayError) -> (ErrorCategory, Severity) {
        let c = classify(&error);
        (c.category, c.severity)
    }

    #[test]
    fn typed_variants() {
        assert_eq!(
            cat(UpdateRelayError::Network("refused".into())),
            (ErrorCategory::Network, Severity::High)
        );
        assert_eq!(
            cat(UpdateRelayError::Timeout("5s".into())),
            (ErrorCategory::Timeout, Severity::High)
        );
        assert_eq!(
            cat(UpdateRelayError::validation("missing title")),
            (ErrorCategory::Validation, Severity::Medium)
        );
        assert_eq!(
            cat(UpdateRelayError::parse("bad json")),
            (ErrorCategory::Validation, Severity::Medium)
        );
        assert_eq!(
            cat(UpdateRelayError::Authentication {
                message: "expired".into()
            }),
            (ErrorCategory::Authentication, Severity::Critical)
        );
        assert_eq!(
            cat(UpdateRelayError::Storage("replica lag".into())),
            (ErrorCategory::Database, Severity::High)
        );
        assert_eq!(
            cat(UpdateRelayError::QueueClosed),
            (ErrorCategory::Resource, Severity::High)
        );
    }

    #[test]
    fn http_status_mapping() {
        let http = |status| UpdateRelayError::Http {
            url: "https://hooks.example.com".into(),
            status,
        };
        assert_eq!(cat(http(401)).0, ErrorCategory::Authentication);
        assert_eq!(cat(http(403)), (ErrorCategory::Authorization, Severity::Critical));
        assert_eq!(cat(http(429)).0, ErrorCategory::RateLimit);
        assert_eq!(cat(http(504)).0, ErrorCategory::Timeout);
        assert_eq!(cat(http(500)), (ErrorCategory::Api, Severity::Medium));
        assert_eq!(cat(http(404)).0, ErrorCategory::Api);
    }

    #[test]
    fn message_inspection() {
        let other = |m: &str| cat(UpdateRelayError::Other(m.into())).0;
        assert_eq!(other("operation timed out after 5s"), ErrorCategory::Timeout);
        assert_eq!(other("Connection refused (os error 111)"), ErrorCategory::Network);
        assert_eq!(other("upstream said: Too Many Requests"), ErrorCategory::RateLimit);
        assert_eq!(other("permission denied"), ErrorCategory::Authorization);
        assert_eq!(other("database is locked"), ErrorCategory::Database);
    }

    #[test]
    fn unmatched_message_is_unknown_medium() {
        assert_eq!(
            cat(UpdateRelayError::Other("something odd happened".into())),
            (ErrorCategory::Unknown, Severity::Medium)
        );
    }
}
