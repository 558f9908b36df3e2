//! Retry / circuit-breaker / fallback executor.

use std::collections::BTreeMap;
use std::future::Future;

use tracing::{debug, error, info, warn};

use updaterelay_shared::{
    ErrorCategory, FallbackAction, PipelineConfig, RecoveryStrategy, Result, Severity,
    UpdateRelayError,
};

use crate::breaker::{BreakerKey, BreakerSnapshot, BreakerTable};
use crate::classify::{Classification, classify};
use crate::history::{ErrorContext, ErrorHistory};

/// What is being attempted: the failure domain it belongs to and the
/// dependency it talks to. Together they pick the strategy and the breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub domain: ErrorCategory,
    pub source: String,
}

impl Operation {
    pub fn new(domain: ErrorCategory, source: impl Into<String>) -> Self {
        Self {
            domain,
            source: source.into(),
        }
    }

    fn breaker_key(&self) -> BreakerKey {
        BreakerKey::new(self.domain, self.source.clone())
    }
}

/// Outcome of [`RecoveryExecutor::execute`].
#[derive(Debug)]
pub enum Recovery<T> {
    /// The operation succeeded on attempt number `attempts`.
    Completed { value: T, attempts: u32 },
    /// Retries ran out or the breaker was open; the fallback ran.
    Degraded {
        action: FallbackAction,
        value: Option<T>,
        short_circuited: bool,
    },
    /// The input itself was bad. Not retried.
    Rejected { context: ErrorContext },
}

impl<T> Recovery<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Runs fallible async operations under their domain's recovery strategy.
#[derive(Debug)]
pub struct RecoveryExecutor {
    strategies: BTreeMap<ErrorCategory, RecoveryStrategy>,
    breakers: BreakerTable,
    history: ErrorHistory,
}

impl RecoveryExecutor {
    pub fn new(
        strategies: BTreeMap<ErrorCategory, RecoveryStrategy>,
        breakers: BreakerTable,
        history: ErrorHistory,
    ) -> Self {
        Self {
            strategies,
            breakers,
            history,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.strategies.clone(),
            BreakerTable::new(config.breaker_threshold, config.breaker_reset_timeout),
            ErrorHistory::new(config.history_retention, config.history_max_entries),
        )
    }

    /// Strategy for `category`, falling back to the `unknown` strategy.
    pub fn strategy_for(&self, category: ErrorCategory) -> RecoveryStrategy {
        self.strategies
            .get(&category)
            .or_else(|| self.strategies.get(&ErrorCategory::Unknown))
            .cloned()
            .unwrap_or_else(|| RecoveryStrategy::default_for(ErrorCategory::Unknown))
    }

    /// Run `attempt` until it succeeds, the strategy's retries run out, or
    /// the breaker opens; then run `fallback` with the strategy's action.
    ///
    /// The operation's domain picks the strategy and the breaker. A rate
    /// limit or timeout failure switches to that category's strategy, if one
    /// is configured, for the rest of the call.
    ///
    /// Validation failures come back as [`Recovery::Rejected`]. Security
    /// failures come back as `Err` untouched.
    pub async fn execute<T, F, Fut, FB>(
        &self,
        op: &Operation,
        mut attempt: F,
        fallback: FB,
    ) -> Result<Recovery<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(FallbackAction) -> Option<T>,
    {
        let mut strategy = self.strategy_for(op.domain);
        let key = op.breaker_key();

        if !self.breakers.allow(&key) {
            debug!(breaker = %key, strategy = %strategy.name, "breaker open, skipping attempt");
            return Ok(Recovery::Degraded {
                action: strategy.fallback_action,
                value: fallback(strategy.fallback_action),
                short_circuited: true,
            });
        }

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let err = match attempt().await {
                Ok(value) => {
                    self.breakers.record_success(&key);
                    if attempts > 1 {
                        info!(breaker = %key, attempts, "recovered after retry");
                    }
                    return Ok(Recovery::Completed { value, attempts });
                }
                Err(err) => err,
            };

            let classification = classify(&err);
            let context = self.record(&err, classification, op, Some(attempts));

            if !classification.category.is_retryable() {
                self.breakers.release(&key);
                return match classification.category {
                    ErrorCategory::Validation => Ok(Recovery::Rejected { context }),
                    _ => Err(err),
                };
            }

            if classification.category.paces_retries() {
                if let Some(paced) = self.strategies.get(&classification.category) {
                    if paced.name != strategy.name {
                        debug!(
                            breaker = %key,
                            from = %strategy.name,
                            to = %paced.name,
                            "switching recovery strategy"
                        );
                        strategy = paced.clone();
                    }
                }
            }

            self.breakers.record_failure(&key);

            if attempts > strategy.retry_count {
                break;
            }
            if !self.breakers.allow(&key) {
                debug!(breaker = %key, attempts, "breaker opened mid-retry, stopping");
                break;
            }

            let delay = strategy.backoff_delay(attempts);
            debug!(
                breaker = %key,
                strategy = %strategy.name,
                retry = attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }

        warn!(
            breaker = %key,
            strategy = %strategy.name,
            attempts,
            action = %strategy.fallback_action,
            "retries exhausted, running fallback"
        );
        Ok(Recovery::Degraded {
            action: strategy.fallback_action,
            value: fallback(strategy.fallback_action),
            short_circuited: false,
        })
    }

    /// Classify, log, and record a failure that happened outside `execute`.
    pub fn report(&self, error: &UpdateRelayError, op: &Operation) -> ErrorContext {
        self.record(error, classify(error), op, None)
    }

    pub fn error_history(&self, window: Option<std::time::Duration>) -> Vec<ErrorContext> {
        self.history.entries(window)
    }

    pub fn clear_error_history(&self, window: Option<std::time::Duration>) -> usize {
        self.history.prune(window)
    }

    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }

    pub fn breakers(&self) -> &BreakerTable {
        &self.breakers
    }

    fn record(
        &self,
        error: &UpdateRelayError,
        classification: Classification,
        op: &Operation,
        attempt: Option<u32>,
    ) -> ErrorContext {
        let mut metadata = BTreeMap::from([
            ("source".to_string(), op.source.clone()),
            ("domain".to_string(), op.domain.to_string()),
        ]);
        if let Some(attempt) = attempt {
            metadata.insert("attempt".to_string(), attempt.to_string());
        }

        let context = ErrorContext::from_error(error, classification, metadata);
        log_failure(&context, op);
        self.history.record(context.clone());
        context
    }
}

fn log_failure(context: &ErrorContext, op: &Operation) {
    let category = context.category.as_str();
    let attempt = context.metadata.get("attempt").map(String::as_str).unwrap_or("-");
    let message = context.message.as_str();

    match context.severity {
        Severity::Critical => error!(
            critical = true,
            category,
            source = %op.source,
            attempt,
            error = message,
            "operation failed"
        ),
        Severity::High => error!(category, source = %op.source, attempt, error = message, "operation failed"),
        Severity::Medium => warn!(category, source = %op.source, attempt, error = message, "operation failed"),
        Severity::Low => info!(category, source = %op.source, attempt, error = message, "operation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::breaker::BreakerState;

    const THRESHOLD: u32 = 5;
    const RESET: Duration = Duration::from_secs(60);

    fn executor() -> RecoveryExecutor {
        let strategies = BTreeMap::from([
            (
                ErrorCategory::Network,
                RecoveryStrategy::new(
                    "network_retry",
                    3,
                    Duration::from_millis(100),
                    FallbackAction::UseCachedData,
                ),
            ),
            (
                ErrorCategory::Api,
                RecoveryStrategy::new(
                    "api_circuit_breaker",
                    2,
                    Duration::from_millis(100),
                    FallbackAction::UseCachedResponse,
                ),
            ),
            (
                ErrorCategory::Unknown,
                RecoveryStrategy::new(
                    "conservative_retry",
                    1,
                    Duration::from_millis(100),
                    FallbackAction::ReturnEmpty,
                ),
            ),
        ]);
        RecoveryExecutor::new(
            strategies,
            BreakerTable::new(THRESHOLD, RESET),
            ErrorHistory::new(Duration::from_secs(3600), 1000),
        )
    }

    fn network_op() -> Operation {
        Operation::new(ErrorCategory::Network, "upstream")
    }

    fn network_error() -> UpdateRelayError {
        UpdateRelayError::Network("connection refused".into())
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success() {
        let exec = executor();
        let outcome = exec
            .execute(&network_op(), || async { Ok::<_, UpdateRelayError>(7) }, |_| None)
            .await
            .unwrap();

        assert!(matches!(outcome, Recovery::Completed { value: 7, attempts: 1 }));
        assert!(exec.error_history(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let exec = executor();
        let calls = AtomicU32::new(0);

        let outcome = exec
            .execute(
                &network_op(),
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 2 { Err(network_error()) } else { Ok(n) } }
                },
                |_| None,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, Recovery::Completed { value: 2, attempts: 3 }));
        assert_eq!(exec.error_history(None).len(), 2);
        assert_eq!(
            exec.breakers().state(&network_op().breaker_key()),
            BreakerState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_runs_fallback_with_exponential_backoff() {
        let exec = executor();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let outcome = exec
            .execute(
                &network_op(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<u32, _>(network_error()) }
                },
                |action| {
                    assert_eq!(action, FallbackAction::UseCachedData);
                    Some(42)
                },
            )
            .await
            .unwrap();

        // 1 + 3 retries, sleeping 100 + 200 + 400 ms between them
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700));
        assert!(elapsed < Duration::from_millis(710));
        assert!(matches!(
            outcome,
            Recovery::Degraded {
                action: FallbackAction::UseCachedData,
                value: Some(42),
                short_circuited: false
            }
        ));

        let history = exec.error_history(None);
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].metadata["attempt"], "4");
        assert_eq!(history[0].metadata["domain"], "network");
    }

    #[tokio::test(start_paused = true)]
    async fn validation_is_rejected_without_retry() {
        let exec = executor();
        let calls = AtomicU32::new(0);

        let outcome = exec
            .execute(
                &network_op(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(UpdateRelayError::validation("missing title")) }
                },
                |_| panic!("fallback must not run"),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let Recovery::Rejected { context } = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(context.category, ErrorCategory::Validation);
        assert!(exec.breaker_states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn security_errors_propagate() {
        let exec = executor();
        let calls = AtomicU32::new(0);

        let result = exec
            .execute(
                &Operation::new(ErrorCategory::Api, "https://hooks.example.com"),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(UpdateRelayError::Http {
                            url: "https://hooks.example.com".into(),
                            status: 401,
                        })
                    }
                },
                |_| None,
            )
            .await;

        assert!(matches!(
            result,
            Err(UpdateRelayError::Http { status: 401, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let history = exec.error_history(None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].severity, Severity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_short_circuits_and_recovers() {
        let exec = executor();
        let op = network_op();
        let calls = AtomicU32::new(0);
        let failing = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(network_error()) }
        };

        // 4 failures, breaker still closed
        exec.execute(&op, failing, |_| None).await.unwrap();
        assert_eq!(exec.breakers().state(&op.breaker_key()), BreakerState::Closed);

        // 5th failure opens it; no further retries in this call
        let outcome = exec.execute(&op, failing, |_| None).await.unwrap();
        assert!(matches!(outcome, Recovery::Degraded { short_circuited: false, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(exec.breakers().state(&op.breaker_key()), BreakerState::Open);

        // open: fallback without attempting
        let outcome = exec.execute(&op, failing, |_| Some(1)).await.unwrap();
        assert!(matches!(
            outcome,
            Recovery::Degraded { value: Some(1), short_circuited: true, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // after the cool-down a successful probe closes it
        tokio::time::advance(RESET).await;
        let outcome = exec
            .execute(&op, || async { Ok::<_, UpdateRelayError>(9) }, |_| None)
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(exec.breakers().state(&op.breaker_key()), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn domain_selects_strategy_and_breaker() {
        let exec = executor();
        let op = Operation::new(ErrorCategory::Api, "https://hooks.example.com/a");
        let calls = AtomicU32::new(0);

        // a network error inside an api operation uses the api strategy (2 retries)
        let outcome = exec
            .execute(
                &op,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(network_error()) }
                },
                |_| None,
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            outcome,
            Recovery::Degraded { action: FallbackAction::UseCachedResponse, .. }
        ));
        let states = exec.breaker_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].key.to_string(), "api_https://hooks.example.com/a");
        assert_eq!(states[0].failure_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_switches_to_its_own_strategy() {
        let mut exec = executor();
        exec.strategies.insert(
            ErrorCategory::RateLimit,
            RecoveryStrategy::new(
                "rate_limit_backoff",
                4,
                Duration::from_secs(30),
                FallbackAction::QueueRequest,
            ),
        );
        let op = Operation::new(ErrorCategory::Api, "https://hooks.example.com/busy");
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let outcome = exec
            .execute(
                &op,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(UpdateRelayError::Http {
                            url: "https://hooks.example.com/busy".into(),
                            status: 429,
                        })
                    }
                },
                |_| None,
            )
            .await
            .unwrap();

        // 1 + 4 retries at 30, 60, 120, 240 s; breaker stays on the api key
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() >= Duration::from_secs(450));
        assert!(matches!(
            outcome,
            Recovery::Degraded { action: FallbackAction::QueueRequest, .. }
        ));
        let states = exec.breaker_states();
        assert_eq!(states[0].key, op.breaker_key());
        assert_eq!(states[0].failure_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_category_without_strategy_keeps_domain_strategy() {
        let exec = executor();
        let calls = AtomicU32::new(0);

        let outcome = exec
            .execute(
                &Operation::new(ErrorCategory::Api, "https://hooks.example.com/slow"),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(UpdateRelayError::Timeout("slow".into())) }
                },
                |_| None,
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            outcome,
            Recovery::Degraded { action: FallbackAction::UseCachedResponse, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_probe_frees_half_open_breaker() {
        let exec = executor();
        let op = network_op();
        for _ in 0..THRESHOLD {
            exec.breakers().record_failure(&op.breaker_key());
        }
        tokio::time::advance(RESET).await;

        let outcome = exec
            .execute(
                &op,
                || async { Err::<(), _>(UpdateRelayError::validation("bad shape")) },
                |_| None,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, Recovery::Rejected { .. }));
        assert_eq!(exec.breakers().state(&op.breaker_key()), BreakerState::HalfOpen);

        // the next caller may probe straight away
        let outcome = exec
            .execute(&op, || async { Ok::<_, UpdateRelayError>(1) }, |_| None)
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(exec.breakers().state(&op.breaker_key()), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_strategy_uses_unknown() {
        let exec = executor();
        let strategy = exec.strategy_for(ErrorCategory::Database);
        assert_eq!(strategy.name, "conservative_retry");
        assert_eq!(strategy.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn report_records_without_touching_breakers() {
        let exec = executor();
        let ctx = exec.report(
            &UpdateRelayError::Other("connection reset by peer".into()),
            &Operation::new(ErrorCategory::Resource, "cache"),
        );

        assert_eq!(ctx.category, ErrorCategory::Network);
        assert!(!ctx.metadata.contains_key("attempt"));
        assert_eq!(exec.clear_error_history(None), 1);
        assert!(exec.breaker_states().is_empty());
    }
}
