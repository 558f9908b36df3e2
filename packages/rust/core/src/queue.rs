//! Bounded FIFO between producers and the processor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use updaterelay_shared::UpdateRecord;

use crate::processor::PipelineObserver;
use crate::validator;

/// What travels through the channel.
#[derive(Debug)]
pub(crate) enum QueueItem {
    Update(UpdateRecord),
    /// Acknowledged once every earlier item is processed and every delivery
    /// dispatched so far has finished.
    Flush(oneshot::Sender<()>),
}

/// Producer handle. Clones share the same channel.
#[derive(Clone)]
pub struct UpdateQueue {
    tx: mpsc::Sender<QueueItem>,
    enqueue_timeout: Duration,
    observer: Arc<dyn PipelineObserver>,
}

impl std::fmt::Debug for UpdateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateQueue")
            .field("depth", &self.depth())
            .field("capacity", &self.tx.max_capacity())
            .field("enqueue_timeout", &self.enqueue_timeout)
            .finish()
    }
}

impl UpdateQueue {
    pub(crate) fn new(
        capacity: usize,
        enqueue_timeout: Duration,
        observer: Arc<dyn PipelineObserver>,
    ) -> (Self, mpsc::Receiver<QueueItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                enqueue_timeout,
                observer,
            },
            rx,
        )
    }

    /// Validate and enqueue. `false` means the record was not accepted:
    /// invalid, queue full past the timeout, or queue closed.
    pub async fn enqueue(&self, record: UpdateRecord) -> bool {
        if let Err(e) = validator::validate_record(&record, Utc::now()) {
            warn!(
                category = %record.category(),
                source = record.source(),
                error = %e,
                "rejected invalid update"
            );
            self.observer.rejected(&record, &e.to_string());
            return false;
        }

        let category = record.category();
        match tokio::time::timeout(self.enqueue_timeout, self.tx.reserve()).await {
            Ok(Ok(permit)) => {
                self.observer.accepted(&record);
                permit.send(QueueItem::Update(record));
                debug!(%category, depth = self.depth(), "enqueued update");
                true
            }
            Ok(Err(_closed)) => {
                warn!(%category, "queue closed, update not accepted");
                self.observer.rejected(&record, "queue closed");
                false
            }
            Err(_elapsed) => {
                warn!(
                    %category,
                    timeout_ms = self.enqueue_timeout.as_millis() as u64,
                    "queue full, update not accepted"
                );
                self.observer.rejected(&record, "queue full");
                false
            }
        }
    }

    /// Send a flush marker and wait for the processor to reach it. Returns
    /// `false` if the queue or processor is gone.
    pub async fn flush(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.tx.send(QueueItem::Flush(ack)).await.is_err() {
            return false;
        }
        done.await.is_ok()
    }

    /// Items currently buffered. A pending [`flush`](Self::flush) marker
    /// occupies a slot like an update and is counted until the processor
    /// reaches it.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
