//! Per-key circuit breakers.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use updaterelay_shared::ErrorCategory;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// A breaker is scoped to one failure domain talking to one source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BreakerKey {
    pub category: ErrorCategory,
    pub source: String,
}

impl BreakerKey {
    pub fn new(category: ErrorCategory, source: impl Into<String>) -> Self {
        Self {
            category,
            source: source.into(),
        }
    }
}

impl std::fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.category, self.source)
    }
}

/// Closed → open after `threshold` failures; open → half-open once
/// `reset_timeout` has passed since the last failure.
///
/// Half-open admits one probe at a time. A probe that never reports back
/// is replaced after another `reset_timeout`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    failure_count: u32,
    state: BreakerState,
    last_failure: Option<Instant>,
    probe_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_timeout,
            failure_count: 0,
            state: BreakerState::Closed,
            last_failure: None,
            probe_started: None,
        }
    }

    /// Whether a call may go through at `now`. Moves an open breaker whose
    /// cool-down has elapsed to half-open and admits the caller as its probe.
    pub fn allow_request(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                let free = self
                    .probe_started
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.reset_timeout);
                if free {
                    self.probe_started = Some(now);
                }
                free
            }
            BreakerState::Open => {
                let cooled = self
                    .last_failure
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.reset_timeout);
                if cooled {
                    self.state = BreakerState::HalfOpen;
                    self.probe_started = Some(now);
                }
                cooled
            }
        }
    }

    /// The probe finished without a verdict on the dependency.
    pub fn release_probe(&mut self) {
        self.probe_started = None;
    }

    pub fn record_failure(&mut self, now: Instant) -> BreakerState {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);
        self.probe_started = None;

        match self.state {
            BreakerState::Closed if self.failure_count >= self.threshold => {
                self.state = BreakerState::Open;
            }
            BreakerState::HalfOpen => self.state = BreakerState::Open,
            _ => {}
        }
        self.state
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = BreakerState::Closed;
        self.probe_started = None;
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// Admin view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub key: BreakerKey,
    pub state: BreakerState,
    pub failure_count: u32,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// One breaker per key, created lazily in the closed state.
///
/// Every transition runs under the key's shard lock.
#[derive(Debug)]
pub struct BreakerTable {
    breakers: DashMap<BreakerKey, CircuitBreaker>,
    threshold: u32,
    reset_timeout: Duration,
}

impl BreakerTable {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            threshold,
            reset_timeout,
        }
    }

    pub fn allow(&self, key: &BreakerKey) -> bool {
        let Some(mut breaker) = self.breakers.get_mut(key) else {
            return true;
        };
        let before = breaker.state();
        let allowed = breaker.allow_request(Instant::now());
        if before == BreakerState::Open && breaker.state() == BreakerState::HalfOpen {
            info!(breaker = %key, "circuit breaker half-open, probing");
        }
        allowed
    }

    pub fn record_failure(&self, key: &BreakerKey) -> BreakerState {
        let mut breaker = self
            .breakers
            .entry(key.clone())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.reset_timeout));

        let before = breaker.state();
        let after = breaker.record_failure(Instant::now());
        if before != BreakerState::Open && after == BreakerState::Open {
            warn!(
                breaker = %key,
                failures = breaker.failure_count(),
                "circuit breaker opened"
            );
        }
        after
    }

    pub fn record_success(&self, key: &BreakerKey) {
        if let Some(mut breaker) = self.breakers.get_mut(key) {
            if breaker.state() != BreakerState::Closed {
                info!(breaker = %key, "circuit breaker closed");
            }
            breaker.record_success();
        }
    }

    /// Let another caller probe a half-open breaker. For attempts that ended
    /// without touching the breaker (rejected or security failures).
    pub fn release(&self, key: &BreakerKey) {
        if let Some(mut breaker) = self.breakers.get_mut(key) {
            breaker.release_probe();
        }
    }

    /// Current state; keys never seen are closed.
    pub fn state(&self, key: &BreakerKey) -> BreakerState {
        self.breakers
            .get(key)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Every known breaker, sorted by key.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                key: entry.key().clone(),
                state: entry.state(),
                failure_count: entry.failure_count(),
            })
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESET: Duration = Duration::from_secs(60);

    #[test]
    fn opens_at_threshold() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, RESET);

        assert_eq!(breaker.record_failure(now), BreakerState::Closed);
        assert_eq!(breaker.record_failure(now), BreakerState::Closed);
        assert_eq!(breaker.record_failure(now), BreakerState::Open);
        assert!(!breaker.allow_request(now));
    }

    #[test]
    fn cool_down_moves_to_half_open() {
        let start = Instant::now();
        let mut breaker = CircuitBreaker::new(1, RESET);
        breaker.record_failure(start);

        assert!(!breaker.allow_request(start + Duration::from_secs(59)));
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow_request(start + RESET));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_timer() {
        let start = Instant::now();
        let mut breaker = CircuitBreaker::new(1, RESET);
        breaker.record_failure(start);
        assert!(breaker.allow_request(start + RESET));

        let probe_failed = start + RESET + Duration::from_secs(1);
        assert_eq!(breaker.record_failure(probe_failed), BreakerState::Open);
        assert!(!breaker.allow_request(start + RESET + Duration::from_secs(30)));
        assert!(breaker.allow_request(probe_failed + RESET));
    }

    #[test]
    fn half_open_admits_one_probe_at_a_time() {
        let start = Instant::now();
        let mut breaker = CircuitBreaker::new(1, RESET);
        breaker.record_failure(start);

        let cooled = start + RESET;
        assert!(breaker.allow_request(cooled));
        assert!(!breaker.allow_request(cooled));
        assert!(!breaker.allow_request(cooled + Duration::from_secs(10)));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.release_probe();
        assert!(breaker.allow_request(cooled + Duration::from_secs(10)));

        breaker.record_success();
        assert!(breaker.allow_request(cooled + Duration::from_secs(11)));
        assert!(breaker.allow_request(cooled + Duration::from_secs(11)));
    }

    #[test]
    fn stuck_probe_is_replaced_after_reset_timeout() {
        let start = Instant::now();
        let mut breaker = CircuitBreaker::new(1, RESET);
        breaker.record_failure(start);

        assert!(breaker.allow_request(start + RESET));
        assert!(!breaker.allow_request(start + RESET + Duration::from_secs(59)));
        assert!(breaker.allow_request(start + RESET + RESET));
    }

    #[test]
    fn success_resets() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(2, RESET);
        breaker.record_failure(now);
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);

        // count restarted, so one more failure stays closed
        assert_eq!(breaker.record_failure(now), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn table_tracks_keys_independently() {
        let table = BreakerTable::new(2, RESET);
        let a = BreakerKey::new(ErrorCategory::Api, "https://a.example.com/hook");
        let b = BreakerKey::new(ErrorCategory::Api, "https://b.example.com/hook");

        table.record_failure(&a);
        table.record_failure(&a);

        assert_eq!(table.state(&a), BreakerState::Open);
        assert!(!table.allow(&a));
        assert!(table.allow(&b));
        assert_eq!(table.state(&b), BreakerState::Closed);

        tokio::time::advance(RESET).await;
        assert!(table.allow(&a));
        table.record_success(&a);
        assert_eq!(table.state(&a), BreakerState::Closed);
    }

    #[test]
    fn snapshot_lists_known_keys() {
        let table = BreakerTable::new(5, RESET);
        let key = BreakerKey::new(ErrorCategory::Resource, "cache");
        table.record_failure(&key);

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key.to_string(), "resource_cache");
        assert_eq!(snapshot[0].state, BreakerState::Closed);
        assert_eq!(snapshot[0].failure_count, 1);
    }
}
