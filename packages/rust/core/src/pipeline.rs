//! The pipeline facade: producers enqueue, admins inspect, one processor
//! task does the work.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use updaterelay_cache::{CacheTier, DualCache};
use updaterelay_recovery::{BreakerSnapshot, ErrorContext, Operation, Recovery, RecoveryExecutor};
use updaterelay_shared::{
    Category, ErrorCategory, FallbackAction, Payload, PipelineConfig, Result, UpdateRecord,
};
use updaterelay_webhooks::{NotifyReport, WebhookNotifier, WebhookRegistry};

use crate::processor::{PipelineObserver, Processor, SilentObserver};
use crate::queue::UpdateQueue;
use crate::validator;

/// Sizes reported by [`UpdatePipeline::get_cache_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PipelineStats {
    pub ttl_size: usize,
    pub recency_size: usize,
    pub queue_depth: usize,
}

/// Handle to a running pipeline.
///
/// Must be created inside a tokio runtime; the processor is spawned on
/// construction and runs until [`shutdown`](Self::shutdown) or drop.
pub struct UpdatePipeline {
    cache: Arc<DualCache>,
    executor: Arc<RecoveryExecutor>,
    notifier: WebhookNotifier,
    queue: UpdateQueue,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for UpdatePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatePipeline")
            .field("stats", &self.get_cache_stats())
            .finish_non_exhaustive()
    }
}

impl UpdatePipeline {
    pub fn start(config: &PipelineConfig) -> Result<Self> {
        Self::with_observer(config, Arc::new(SilentObserver))
    }

    pub fn with_observer(
        config: &PipelineConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<Self> {
        let cache = Arc::new(DualCache::from_config(config));
        let executor = Arc::new(RecoveryExecutor::from_config(config));
        let registry = Arc::new(WebhookRegistry::new(config.allow_private_targets));
        let notifier = WebhookNotifier::new(registry, executor.clone(), config)?;

        let (queue, rx) = UpdateQueue::new(
            config.queue_capacity,
            config.enqueue_timeout,
            observer.clone(),
        );
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let processor = Processor {
            cache: cache.clone(),
            executor: executor.clone(),
            notifier: notifier.clone(),
            observer,
            max_in_flight: config.max_in_flight_deliveries.max(1),
        };
        let worker = tokio::spawn(processor.run(rx, shutdown_rx));

        info!(
            queue_capacity = config.queue_capacity,
            ttl_secs = config.ttl.as_secs(),
            "update pipeline started"
        );

        Ok(Self {
            cache,
            executor,
            notifier,
            queue,
            shutdown: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    // -----------------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------------

    /// Stamp, validate, and enqueue an update. `false` means not accepted.
    pub async fn enqueue(
        &self,
        category: Category,
        payload: Payload,
        source: &str,
        version: &str,
    ) -> bool {
        self.queue
            .enqueue(UpdateRecord::new(category, payload, source, version))
            .await
    }

    /// As [`enqueue`](Self::enqueue), with the category given by name.
    pub async fn enqueue_raw(
        &self,
        category: &str,
        payload: Payload,
        source: &str,
        version: &str,
    ) -> bool {
        match validator::parse_category(category) {
            Ok(category) => self.enqueue(category, payload, source, version).await,
            Err(e) => {
                warn!(category, source, error = %e, "rejected update with unknown category");
                false
            }
        }
    }

    /// Enqueue a record that carries its own timestamp.
    pub async fn enqueue_record(&self, record: UpdateRecord) -> bool {
        self.queue.enqueue(record).await
    }

    /// A clone of the producer handle, for feeding the pipeline from other
    /// tasks.
    pub fn queue(&self) -> UpdateQueue {
        self.queue.clone()
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    /// Fresh TTL copy, else the recency copy, else `None`.
    pub fn get_cached(&self, category: Category, payload: &Payload) -> Option<Payload> {
        self.cache.get(category, payload)
    }

    /// Fetch from an upstream source, caching the result under `shape`.
    ///
    /// Failures go through the `network` strategy; when it falls back to
    /// cached data, the cached value for `shape` (fresh or stale) is served.
    /// `Ok(None)` means nothing could be produced. Only security failures
    /// are errors.
    #[instrument(skip_all, fields(category = %category, source = source))]
    pub async fn fetch_through<F, Fut>(
        &self,
        category: Category,
        shape: &Payload,
        source: &str,
        fetch: F,
    ) -> Result<Option<Payload>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Payload>>,
    {
        let op = Operation::new(ErrorCategory::Network, source);
        let cache = &self.cache;

        let outcome = self
            .executor
            .execute(&op, fetch, |action| match action {
                FallbackAction::UseCachedData | FallbackAction::UseCachedResponse => {
                    cache.get(category, shape)
                }
                _ => None,
            })
            .await?;

        match outcome {
            Recovery::Completed { value, attempts } => {
                if let Err(e) = self.cache.put_for(category, shape, value.clone()) {
                    warn!(error = %e, "fetched value not cached");
                }
                debug!(attempts, "fetched from upstream");
                Ok(Some(value))
            }
            Recovery::Degraded {
                value,
                action,
                short_circuited,
            } => {
                debug!(%action, short_circuited, served = value.is_some(), "fetch degraded");
                Ok(value)
            }
            Recovery::Rejected { .. } => Ok(None),
        }
    }

    pub fn get_cache_stats(&self) -> PipelineStats {
        let cache = self.cache.stats();
        PipelineStats {
            ttl_size: cache.ttl_size,
            recency_size: cache.recency_size,
            queue_depth: self.queue.depth(),
        }
    }

    /// Errors within `window` of now; all retained errors when `None`.
    pub fn get_error_history(&self, window: Option<Duration>) -> Vec<ErrorContext> {
        self.executor.error_history(window)
    }

    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.executor.breaker_states()
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub fn register_webhook(&self, category: Category, url: &str) -> bool {
        self.notifier.registry().register(category, url)
    }

    pub fn unregister_webhook(&self, category: Category, url: &str) -> bool {
        self.notifier.registry().unregister(category, url)
    }

    pub fn webhooks(&self) -> &WebhookRegistry {
        self.notifier.registry()
    }

    /// Retry deliveries parked by the `queue_request` fallback.
    pub async fn redeliver_deferred(&self) -> NotifyReport {
        self.notifier.redeliver_deferred().await
    }

    // -----------------------------------------------------------------------
    // Admin
    // -----------------------------------------------------------------------

    /// Clear one cache tier, or both when `tier` is `None`.
    pub fn clear_cache(&self, tier: Option<CacheTier>) {
        self.cache.clear(tier);
        info!(?tier, "cache cleared");
    }

    /// Drop errors older than `window`, or all of them. Returns how many
    /// were removed.
    pub fn clear_error_history(&self, window: Option<Duration>) -> usize {
        self.executor.clear_error_history(window)
    }

    /// Wait until everything enqueued so far is cached and every delivery
    /// dispatched so far has finished.
    pub async fn flush(&self) -> bool {
        self.queue.flush().await
    }

    /// Stop accepting updates, drain the queue and in-flight deliveries, and
    /// wait for the processor to exit. Idempotent.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        if let Some(tx) = lock(&self.shutdown).take() {
            let _ = tx.send(());
        }
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "update processor panicked");
            }
            info!("update pipeline stopped");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
