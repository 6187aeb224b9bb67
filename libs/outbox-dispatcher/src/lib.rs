//! Dispatcher: drains pending outbox rows in batches, publishes through a
//! [`BrokerAdapter`], and advances outbox state with bounded retries.
//!
//! Trades latency for simplicity: a polling loop rather than a push
//! subscription, so it never holds a long-lived lock on the outbox table.
//! Delivery is at-least-once — consumers must deduplicate via the
//! idempotency ledger.

use broker_adapter::{BrokerAdapter, SendOutcome};
use outbox_store::OutboxStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod error;
pub mod metrics;

pub use error::{DispatcherError, DispatcherResult};
pub use metrics::DispatcherMetrics;

/// Dispatcher tuning. Defaults match the spec's recognized configuration
/// keys: `batch_size` 100, `max_retry` 5, `poll_interval_seconds` 5.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: i64,
    pub max_retry: i32,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retry: 5,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    /// Load `batch_size`/`max_retry`/`poll_interval_seconds` from the
    /// environment, falling back to the spec's defaults — mirrors the
    /// teacher's `OutboxConsumerConfig::from_env` in shape (typed env var
    /// parsing with a fallback default per field, never a hard failure).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: std::env::var("OUTBOX_DISPATCHER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            max_retry: std::env::var("OUTBOX_DISPATCHER_MAX_RETRY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retry),
            poll_interval: std::env::var("OUTBOX_DISPATCHER_POLL_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
        }
    }
}

/// Drains the outbox into a broker with bounded retries.
pub struct Dispatcher<S: OutboxStore, B: BrokerAdapter> {
    outbox: Arc<S>,
    broker: Arc<B>,
    config: DispatcherConfig,
    metrics: Option<DispatcherMetrics>,
}

impl<S: OutboxStore, B: BrokerAdapter> Dispatcher<S, B> {
    pub fn new(outbox: Arc<S>, broker: Arc<B>, config: DispatcherConfig) -> Self {
        Self {
            outbox,
            broker,
            config,
            metrics: None,
        }
    }

    /// Enable Prometheus metrics, updated once per poll cycle.
    pub fn with_metrics(mut self, metrics: DispatcherMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Drain up to `batch_size` pending records, publishing each in
    /// `created_at` ascending order. Never aborts the batch because one
    /// record failed to send or mark; returns the number successfully
    /// dispatched.
    pub async fn dispatch_once(&self) -> DispatcherResult<usize> {
        let pending = self.outbox.fetch_pending(self.config.batch_size).await?;

        if let Some(metrics) = &self.metrics {
            metrics.pending.set(pending.len() as i64);
            let oldest_age = pending
                .first()
                .map(|record| (chrono::Utc::now() - record.created_at).num_seconds().max(0))
                .unwrap_or(0);
            metrics.oldest_pending_age_seconds.set(oldest_age);
        }

        if pending.is_empty() {
            debug!("dispatcher: no pending records, broker not called");
            return Ok(0);
        }

        let mut sent_count = 0;
        for record in pending {
            // payload/options are already JSON-encoded text in the store;
            // passed through as raw bytes for the adapter to interpret.
            let outcome = self
                .broker
                .send(
                    &record.topic,
                    record.data.as_bytes(),
                    &record.message_id,
                    record.options.as_deref(),
                )
                .await;

            match outcome {
                SendOutcome::Delivered => {
                    if let Err(err) = self.outbox.mark_sent(&record.message_id).await {
                        warn!(
                            message_id = %record.message_id,
                            error = %err,
                            "dispatcher: broker accepted message but mark_sent failed; \
                             message stays pending and may be redelivered"
                        );
                    } else {
                        sent_count += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.sent_total.inc();
                        }
                    }
                }
                SendOutcome::Rejected(reason) => {
                    // The broker will never accept these bytes unchanged;
                    // retrying is pointless, so this goes straight to
                    // failed regardless of the remaining retry budget.
                    if let Err(err) = self.outbox.mark_failed(&record.message_id, &reason).await {
                        warn!(message_id = %record.message_id, error = %err, "dispatcher: mark_failed failed after rejection");
                    }
                }
                SendOutcome::Transient(reason) => {
                    if record.retry_count + 1 >= self.config.max_retry {
                        if let Err(err) = self
                            .outbox
                            .mark_failed(&record.message_id, "max retry exceeded")
                            .await
                        {
                            warn!(message_id = %record.message_id, error = %err, "dispatcher: mark_failed failed at retry exhaustion");
                        }
                    } else if let Err(err) = self.outbox.increment_retry(&record.message_id).await {
                        warn!(message_id = %record.message_id, error = %err, "dispatcher: increment_retry failed");
                    }
                    debug!(message_id = %record.message_id, reason = %reason, "dispatcher: transient send failure");
                }
            }
        }

        Ok(sent_count)
    }

    /// Poll forever (or until `max_iterations` is reached), sleeping
    /// `interval` between cycles. Cooperatively cancellable at the sleep
    /// boundary via `token`; `max_iterations` exists purely to make the
    /// loop testable.
    pub async fn run(
        &self,
        interval: Duration,
        max_iterations: Option<u64>,
        token: CancellationToken,
    ) {
        let mut iterations: u64 = 0;
        loop {
            match self.dispatch_once().await {
                Ok(count) if count > 0 => info!(sent_count = count, "dispatcher: cycle complete"),
                Ok(_) => debug!("dispatcher: cycle complete, nothing to send"),
                Err(err) => warn!(error = %err, "dispatcher: cycle failed"),
            }

            iterations += 1;
            if let Some(max) = max_iterations {
                if iterations >= max {
                    break;
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
