//! The single worker that drains the queue: cache, then fan out.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use updaterelay_cache::DualCache;
use updaterelay_recovery::{Operation, Recovery, RecoveryExecutor};
use updaterelay_shared::{ErrorCategory, UpdateRecord};
use updaterelay_webhooks::{DeliveryReport, WebhookNotifier};

use crate::queue::QueueItem;

/// Callbacks for pipeline activity (CLI progress, tests).
pub trait PipelineObserver: Send + Sync {
    /// A record passed validation and is queued.
    fn accepted(&self, record: &UpdateRecord);
    /// A record was refused at enqueue.
    fn rejected(&self, record: &UpdateRecord, reason: &str);
    /// The processor finished caching a record.
    fn processed(&self, record: &UpdateRecord, cached: bool);
    /// One webhook delivery reached its final status.
    fn delivered(&self, report: &DeliveryReport);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl PipelineObserver for SilentObserver {
    fn accepted(&self, _record: &UpdateRecord) {}
    fn rejected(&self, _record: &UpdateRecord, _reason: &str) {}
    fn processed(&self, _record: &UpdateRecord, _cached: bool) {}
    fn delivered(&self, _report: &DeliveryReport) {}
}

pub(crate) struct Processor {
    pub(crate) cache: Arc<DualCache>,
    pub(crate) executor: Arc<RecoveryExecutor>,
    pub(crate) notifier: WebhookNotifier,
    pub(crate) observer: Arc<dyn PipelineObserver>,
    pub(crate) max_in_flight: usize,
}

impl Processor {
    /// Run until the queue is closed and drained. A failed record never
    /// stops the loop.
    pub(crate) async fn run(
        self,
        mut rx: mpsc::Receiver<QueueItem>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut deliveries: JoinSet<DeliveryReport> = JoinSet::new();
        let mut closing = false;
        let mut processed = 0usize;

        info!(max_in_flight = self.max_in_flight, "update processor started");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown, if !closing => {
                    closing = true;
                    rx.close();
                    info!(pending = rx.len(), "queue closed, draining");
                }
                Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                    self.finish_delivery(joined);
                }
                item = rx.recv() => match item {
                    Some(QueueItem::Update(record)) => {
                        self.process(record, &mut deliveries).await;
                        processed += 1;
                    }
                    Some(QueueItem::Flush(ack)) => {
                        self.drain_deliveries(&mut deliveries).await;
                        // the flusher may have given up waiting
                        let _ = ack.send(());
                    }
                    None => break,
                },
            }
        }

        self.drain_deliveries(&mut deliveries).await;
        info!(processed, "update processor stopped");
    }

    async fn process(&self, record: UpdateRecord, deliveries: &mut JoinSet<DeliveryReport>) {
        let cached = self.cache_record(&record).await;
        self.observer.processed(&record, cached);

        while deliveries.len() >= self.max_in_flight {
            match deliveries.join_next().await {
                Some(joined) => self.finish_delivery(joined),
                None => break,
            }
        }
        self.notifier.dispatch(&record, deliveries);
    }

    async fn cache_record(&self, record: &UpdateRecord) -> bool {
        let op = Operation::new(ErrorCategory::Resource, "cache");
        let cache = &self.cache;

        let outcome = self
            .executor
            .execute(
                &op,
                || std::future::ready(cache.put(record.category(), record.payload())),
                |_| None,
            )
            .await;

        match outcome {
            Ok(Recovery::Completed { value: key, .. }) => {
                debug!(%key, source = record.source(), "processed update");
                true
            }
            Ok(Recovery::Degraded { action, .. }) => {
                warn!(category = %record.category(), %action, "update not cached");
                false
            }
            Ok(Recovery::Rejected { context }) => {
                warn!(category = %record.category(), error = %context.message, "update rejected by cache");
                false
            }
            Err(e) => {
                warn!(category = %record.category(), error = %e, "update not cached");
                false
            }
        }
    }

    fn finish_delivery(&self, joined: Result<DeliveryReport, JoinError>) {
        match joined {
            Ok(report) => self.observer.delivered(&report),
            Err(e) => warn!(error = %e, "delivery task failed"),
        }
    }

    async fn drain_deliveries(&self, deliveries: &mut JoinSet<DeliveryReport>) {
        while let Some(joined) = deliveries.join_next().await {
            self.finish_delivery(joined);
        }
    }
}
