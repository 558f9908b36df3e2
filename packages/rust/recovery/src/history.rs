//! Bounded, time-pruned log of classified failures.

use std::collections::{BTreeMap, VecDeque};
use std::error::Error as _;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use updaterelay_shared::{ErrorCategory, Severity, UpdateRelayError};

use crate::classify::Classification;

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// `Display` of each `source()` link below the error itself.
    pub stack_context: Vec<String>,
    /// Always carries `source` and `domain`.
    pub metadata: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn from_error(
        error: &UpdateRelayError,
        classification: Classification,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let mut stack_context = Vec::new();
        let mut cause = error.source();
        while let Some(inner) = cause {
            stack_context.push(inner.to_string());
            cause = inner.source();
        }

        Self {
            id: Uuid::now_v7(),
            category: classification.category,
            severity: classification.severity,
            message: error.to_string(),
            timestamp: Utc::now(),
            stack_context,
            metadata,
        }
    }
}

/// Append-only history with a size cap and a retention window, both enforced
/// on every insert.
#[derive(Debug)]
pub struct ErrorHistory {
    entries: Mutex<VecDeque<ErrorContext>>,
    retention: Duration,
    max_entries: usize,
}

impl ErrorHistory {
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            retention,
            max_entries,
        }
    }

    pub fn record(&self, context: ErrorContext) {
        if self.max_entries == 0 {
            return;
        }

        let mut entries = self.lock();
        if let Some(cutoff) = cutoff(self.retention) {
            while entries.front().is_some_and(|e| e.timestamp < cutoff) {
                entries.pop_front();
            }
        }
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(context);
    }

    /// Entries within `window` of now, oldest first; everything when `None`.
    pub fn entries(&self, window: Option<Duration>) -> Vec<ErrorContext> {
        let entries = self.lock();
        match window.and_then(cutoff) {
            Some(cutoff) => entries
                .iter()
                .filter(|e| e.timestamp >= cutoff)
                .cloned()
                .collect(),
            None => entries.iter().cloned().collect(),
        }
    }

    /// Drop everything older than `window`, or everything when `None`.
    /// Returns the number of entries removed.
    pub fn prune(&self, window: Option<Duration>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        match window {
            None => entries.clear(),
            Some(window) => {
                if let Some(cutoff) = cutoff(window) {
                    entries.retain(|e| e.timestamp >= cutoff);
                }
            }
        }
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ErrorContext>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `now - window`, or `None` when the window reaches past representable time.
fn cutoff(window: Duration) -> Option<DateTime<Utc>> {
    let window = chrono::Duration::from_std(window).ok()?;
    Utc::now().checked_sub_signed(window)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(message: &str, age: chrono::Duration) -> ErrorContext {
        let error = UpdateRelayError::Network(message.into());
        let mut ctx = ErrorContext::from_error(
            &error,
            crate::classify::classify(&error),
            BTreeMap::from([("source".into(), "test".into())]),
        );
        ctx.timestamp = Utc::now() - age;
        ctx
    }

    #[test]
    fn context_captures_classification_and_source_chain() {
        let error = UpdateRelayError::io(
            "/tmp/updates.jsonl",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        let ctx = ErrorContext::from_error(
            &error,
            crate::classify::classify(&error),
            BTreeMap::new(),
        );

        assert_eq!(ctx.category, ErrorCategory::Resource);
        assert_eq!(ctx.severity, Severity::High);
        assert_eq!(ctx.stack_context, vec!["no such file".to_string()]);
        assert!(ctx.message.contains("/tmp/updates.jsonl"));
    }

    #[test]
    fn window_filters_entries() {
        let history = ErrorHistory::new(Duration::from_secs(86_400), 100);
        history.record(context("old", chrono::Duration::hours(2)));
        history.record(context("recent", chrono::Duration::minutes(5)));

        assert_eq!(history.entries(None).len(), 2);
        let recent = history.entries(Some(Duration::from_secs(3600)));
        assert_eq!(recent.len(), 1);
        assert!(recent[0].message.contains("recent"));
    }

    #[test]
    fn prune_by_window_and_all() {
        let history = ErrorHistory::new(Duration::from_secs(86_400), 100);
        history.record(context("old", chrono::Duration::hours(2)));
        history.record(context("recent", chrono::Duration::minutes(5)));

        assert_eq!(history.prune(Some(Duration::from_secs(3600))), 1);
        assert_eq!(history.len(), 1);
        assert_eq!(history.prune(None), 1);
        assert!(history.is_empty());
    }

    #[test]
    fn max_entries_drops_oldest() {
        let history = ErrorHistory::new(Duration::from_secs(86_400), 2);
        for n in 0..3 {
            history.record(context(&format!("e{n}"), chrono::Duration::zero()));
        }

        let kept: Vec<_> = history.entries(None).into_iter().map(|e| e.message).collect();
        assert_eq!(kept.len(), 2);
        assert!(kept[0].contains("e1"));
        assert!(kept[1].contains("e2"));
    }

    #[test]
    fn retention_prunes_on_insert() {
        let history = ErrorHistory::new(Duration::from_secs(3600), 100);
        history.record(context("stale", chrono::Duration::hours(3)));
        history.record(context("fresh", chrono::Duration::zero()));

        assert_eq!(history.len(), 1);
    }
}
