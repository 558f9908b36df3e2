//! Error types for updaterelay.
//!
//! Library crates use [`UpdateRelayError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Every variant maps to exactly one row of the classifier table in
//! `updaterelay-recovery`; a new variant needs a new row there.

use std::path::PathBuf;

/// Top-level error type for all updaterelay operations.
#[derive(Debug, thiserror::Error)]
pub enum UpdateRelayError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Connection-level failure (DNS, refused, reset).
    #[error("network error: {0}")]
    Network(String),

    /// An attempt exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Remote endpoint answered with a non-2xx status.
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    /// Backing store or upstream database failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Data validation error (missing fields, unknown category, skewed timestamp).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Malformed input that could not be decoded.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Caller identity could not be established.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Caller identity is known but not permitted.
    #[error("authorization denied: {message}")]
    Authorization { message: String },

    /// Upstream asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Local resource exhaustion (capacity bounds, memory, handles).
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// The update queue has been shut down.
    #[error("update queue is closed")]
    QueueClosed,

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Anything not covered above; classified by message inspection.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, UpdateRelayError>;

impl UpdateRelayError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = UpdateRelayError::config("queue capacity must be positive");
        assert_eq!(err.to_string(), "config error: queue capacity must be positive");

        let err = UpdateRelayError::Http {
            url: "https://hooks.example.com/a".into(),
            status: 502,
        };
        assert_eq!(err.to_string(), "HTTP 502 from https://hooks.example.com/a");

        let err = UpdateRelayError::validation("missing field `company`");
        assert!(err.to_string().contains("company"));
    }
}
