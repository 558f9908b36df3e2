//! Concurrent webhook fan-out with per-subscriber recovery.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use updaterelay_recovery::{Operation, Recovery, RecoveryExecutor};
use updaterelay_shared::{
    Category, ErrorCategory, FallbackAction, PipelineConfig, Result, UpdateRecord,
    UpdateRelayError,
};

use crate::registry::WebhookRegistry;

/// User-Agent header for outgoing deliveries.
const USER_AGENT: &str = concat!("UpdateRelay/", env!("CARGO_PKG_VERSION"));

/// Final status of one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// The subscriber answered 2xx.
    Delivered { attempts: u32 },
    /// Retries ran out or the breaker was open; the subscriber missed this
    /// update.
    Degraded {
        action: FallbackAction,
        short_circuited: bool,
    },
    /// Parked on the deferred queue for [`WebhookNotifier::redeliver_deferred`].
    Deferred,
    /// Not retryable (security or malformed request).
    Rejected { reason: String },
}

/// One subscriber's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub category: Category,
    pub url: Url,
    pub status: DeliveryStatus,
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered { .. })
    }
}

/// Outcome of a whole fan-out.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifyReport {
    pub deliveries: Vec<DeliveryReport>,
}

impl NotifyReport {
    pub fn delivered(&self) -> usize {
        self.deliveries.iter().filter(|d| d.is_delivered()).count()
    }

    pub fn failed(&self) -> usize {
        self.deliveries.len() - self.delivered()
    }

    /// Report for `url`, if it was part of this fan-out.
    pub fn for_url(&self, url: &str) -> Option<&DeliveryReport> {
        self.deliveries.iter().find(|d| d.url.as_str() == url)
    }
}

/// How a delivery left this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handoff {
    Posted,
    Parked,
}

#[derive(Debug, Clone)]
struct DeferredDelivery {
    url: Url,
    record: Arc<UpdateRecord>,
}

#[derive(Debug)]
struct NotifierInner {
    client: Client,
    registry: Arc<WebhookRegistry>,
    executor: Arc<RecoveryExecutor>,
    deferred: Mutex<VecDeque<DeferredDelivery>>,
    deferred_capacity: usize,
}

/// Delivers records to every subscriber of their category.
///
/// Cheap to clone; clones share the client, registry, and deferred queue.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    inner: Arc<NotifierInner>,
}

impl WebhookNotifier {
    pub fn new(
        registry: Arc<WebhookRegistry>,
        executor: Arc<RecoveryExecutor>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.webhook_timeout)
            .build()
            .map_err(|e| UpdateRelayError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(NotifierInner {
                client,
                registry,
                executor,
                deferred: Mutex::new(VecDeque::new()),
                deferred_capacity: config.deferred_capacity,
            }),
        })
    }

    pub fn registry(&self) -> &WebhookRegistry {
        &self.inner.registry
    }

    /// Spawn one delivery task per subscriber of the record's category into
    /// `tasks`. Returns the number of tasks spawned.
    pub fn dispatch(&self, record: &UpdateRecord, tasks: &mut JoinSet<DeliveryReport>) -> usize {
        let subscribers = self.inner.registry.subscribers(record.category());
        if subscribers.is_empty() {
            return 0;
        }

        let record = Arc::new(record.clone());
        let count = subscribers.len();
        for url in subscribers {
            tasks.spawn(deliver(self.inner.clone(), url, record.clone()));
        }
        debug!(category = %record.category(), subscribers = count, "dispatched deliveries");
        count
    }

    /// Deliver `record` to every subscriber and wait for all of them,
    /// including retries and fallbacks.
    #[instrument(skip_all, fields(category = %record.category(), source = record.source()))]
    pub async fn notify(&self, record: &UpdateRecord) -> NotifyReport {
        let mut tasks = JoinSet::new();
        self.dispatch(record, &mut tasks);
        join_reports(tasks).await
    }

    /// Retry every parked delivery whose subscription still exists.
    #[instrument(skip_all)]
    pub async fn redeliver_deferred(&self) -> NotifyReport {
        let parked: Vec<DeferredDelivery> = self.inner.lock_deferred().drain(..).collect();
        if parked.is_empty() {
            return NotifyReport::default();
        }

        let mut tasks = JoinSet::new();
        let mut skipped = 0usize;
        for item in parked {
            if !self
                .inner
                .registry
                .is_subscribed(item.record.category(), &item.url)
            {
                skipped += 1;
                continue;
            }
            tasks.spawn(deliver(self.inner.clone(), item.url, item.record));
        }

        let report = join_reports(tasks).await;
        info!(
            redelivered = report.delivered(),
            failed = report.failed(),
            skipped,
            "redelivered deferred webhooks"
        );
        report
    }

    /// Deliveries currently parked.
    pub fn deferred_len(&self) -> usize {
        self.inner.lock_deferred().len()
    }
}

impl NotifierInner {
    fn lock_deferred(&self) -> MutexGuard<'_, VecDeque<DeferredDelivery>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a delivery, dropping the oldest when full. Returns `false` when
    /// nothing can be parked.
    fn defer(&self, url: &Url, record: &Arc<UpdateRecord>) -> bool {
        if self.deferred_capacity == 0 {
            warn!(%url, "deferred queue disabled, dropping delivery");
            return false;
        }

        let mut deferred = self.lock_deferred();
        if deferred.len() >= self.deferred_capacity {
            if let Some(dropped) = deferred.pop_front() {
                warn!(url = %dropped.url, "deferred queue full, dropped oldest delivery");
            }
        }
        deferred.push_back(DeferredDelivery {
            url: url.clone(),
            record: record.clone(),
        });
        true
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

async fn deliver(inner: Arc<NotifierInner>, url: Url, record: Arc<UpdateRecord>) -> DeliveryReport {
    let op = Operation::new(ErrorCategory::Api, url.as_str());
    let client = &inner.client;
    let target = &url;
    let body = record.as_ref();

    let outcome = inner
        .executor
        .execute(
            &op,
            || post(client, target, body),
            |action| {
                (action == FallbackAction::QueueRequest && inner.defer(target, &record))
                    .then_some(Handoff::Parked)
            },
        )
        .await;

    let status = match outcome {
        Ok(Recovery::Completed { attempts, .. }) => DeliveryStatus::Delivered { attempts },
        Ok(Recovery::Degraded {
            value: Some(Handoff::Parked),
            ..
        }) => DeliveryStatus::Deferred,
        Ok(Recovery::Degraded {
            action,
            short_circuited,
            ..
        }) => DeliveryStatus::Degraded {
            action,
            short_circuited,
        },
        Ok(Recovery::Rejected { context }) => DeliveryStatus::Rejected {
            reason: context.message,
        },
        Err(e) => DeliveryStatus::Rejected {
            reason: e.to_string(),
        },
    };

    debug!(%url, ?status, "delivery finished");
    DeliveryReport {
        category: record.category(),
        url,
        status,
    }
}

/// POST the record as JSON. Any non-2xx status is a failure.
async fn post(client: &Client, url: &Url, record: &UpdateRecord) -> Result<Handoff> {
    let response = client
        .post(url.clone())
        .json(record)
        .send()
        .await
        .map_err(|e| send_error(url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(UpdateRelayError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(Handoff::Posted)
}

fn send_error(url: &Url, e: reqwest::Error) -> UpdateRelayError {
    if e.is_timeout() {
        UpdateRelayError::Timeout(format!("{url}: {e}"))
    } else if e.is_builder() {
        UpdateRelayError::parse(format!("{url}: {e}"))
    } else {
        UpdateRelayError::Network(format!("{url}: {e}"))
    }
}

async fn join_reports(mut tasks: JoinSet<DeliveryReport>) -> NotifyReport {
    let mut deliveries = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => deliveries.push(report),
            Err(e) => warn!(error = %e, "delivery task failed"),
        }
    }
    NotifyReport { deliveries }
}
