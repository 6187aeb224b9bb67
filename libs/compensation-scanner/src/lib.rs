//! Compensation Scanner: periodically surfaces permanently-failed outbox
//! and idempotency records to business-level compensation logic.
//!
//! Retry exhaustion means mechanical recovery is no longer possible — what
//! remains is a deliberate, topic-specific decision (refund, restock,
//! cancel) rather than another automatic attempt. Compensators are
//! registered per topic, either as a direct callable or as a name resolved
//! lazily through a [`ServiceRegistry`], mirroring the teacher's split
//! between directly-wired handlers and name-resolved service lookups.

use async_trait::async_trait;
use idempotency_store::{ConsumptionRecord, IdempotencyStore};
use outbox_store::{OutboxRecord, OutboxStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod error;
pub use error::{ScannerError, ScannerResult};

/// The failed record a compensator is asked to act on.
#[derive(Debug, Clone)]
pub enum CompensationRecord {
    Producer(OutboxRecord),
    Consumer(ConsumptionRecord),
}

/// Business-level recovery for one topic's permanently-failed records.
/// Returns `Ok(true)` when compensation succeeded and the record should be
/// marked `compensated`; `Ok(false)` or `Err` leave it `failed`.
#[async_trait]
pub trait Compensator: Send + Sync {
    async fn compensate(&self, record: &CompensationRecord) -> anyhow::Result<bool>;
}

/// Resolves an opaque service name to a compensator, for registrations made
/// by name rather than by direct callable (e.g. plugin-style lookup).
pub trait ServiceRegistry: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Compensator>>;
}

/// Simple in-process [`ServiceRegistry`] backed by a `HashMap`.
#[derive(Default)]
pub struct InProcessServiceRegistry {
    services: Mutex<HashMap<String, Arc<dyn Compensator>>>,
}

impl InProcessServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, compensator: Arc<dyn Compensator>) {
        self.services.lock().unwrap().insert(name.into(), compensator);
    }
}

impl ServiceRegistry for InProcessServiceRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Compensator>> {
        self.services.lock().unwrap().get(name).cloned()
    }
}

#[derive(Clone)]
enum CompensatorBinding {
    Direct(Arc<dyn Compensator>),
    Named(String),
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl ScannerConfig {
    /// Load `batch_size`/`poll_interval_seconds` from the environment,
    /// falling back to the defaults above — same typed-parse-with-fallback
    /// shape as `DispatcherConfig::from_env`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: std::env::var("COMPENSATION_SCANNER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            poll_interval: std::env::var("COMPENSATION_SCANNER_POLL_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
        }
    }
}

/// Polls the outbox and idempotency stores for permanently-failed records
/// and routes each to its registered compensator.
pub struct CompensationScanner<O: OutboxStore, I: IdempotencyStore> {
    outbox: Arc<O>,
    idempotency: Arc<I>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    producer_compensators: Mutex<HashMap<String, CompensatorBinding>>,
    consumer_compensators: Mutex<HashMap<String, CompensatorBinding>>,
    config: ScannerConfig,
}

impl<O: OutboxStore, I: IdempotencyStore> CompensationScanner<O, I> {
    pub fn new(outbox: Arc<O>, idempotency: Arc<I>, config: ScannerConfig) -> Self {
        Self {
            outbox,
            idempotency,
            registry: None,
            producer_compensators: Mutex::new(HashMap::new()),
            consumer_compensators: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn register_producer_compensator(&self, topic: impl Into<String>, compensator: Arc<dyn Compensator>) {
        self.producer_compensators
            .lock()
            .unwrap()
            .insert(topic.into(), CompensatorBinding::Direct(compensator));
    }

    pub fn register_producer_compensator_by_name(&self, topic: impl Into<String>, service_name: impl Into<String>) {
        self.producer_compensators
            .lock()
            .unwrap()
            .insert(topic.into(), CompensatorBinding::Named(service_name.into()));
    }

    pub fn register_consumer_compensator(&self, topic: impl Into<String>, compensator: Arc<dyn Compensator>) {
        self.consumer_compensators
            .lock()
            .unwrap()
            .insert(topic.into(), CompensatorBinding::Direct(compensator));
    }

    pub fn register_consumer_compensator_by_name(&self, topic: impl Into<String>, service_name: impl Into<String>) {
        self.consumer_compensators
            .lock()
            .unwrap()
            .insert(topic.into(), CompensatorBinding::Named(service_name.into()));
    }

    fn resolve(&self, binding: &CompensatorBinding) -> Option<Arc<dyn Compensator>> {
        match binding {
            CompensatorBinding::Direct(c) => Some(c.clone()),
            CompensatorBinding::Named(name) => self.registry.as_ref().and_then(|r| r.resolve(name)),
        }
    }

    /// Scan permanently-failed outbox records once. Never aborts the batch
    /// on a single record's compensator failure; never retries within the
    /// same scan.
    pub async fn check_producer(&self) -> ScannerResult<usize> {
        let records = self.outbox.fetch_failed(self.config.batch_size).await?;
        let mut compensated = 0;

        for record in records {
            let binding = self.producer_compensators.lock().unwrap().get(&record.topic).cloned();
            let Some(binding) = binding else {
                warn!(topic = %record.topic, message_id = %record.message_id, "compensation scanner: no producer compensator registered");
                continue;
            };
            let Some(compensator) = self.resolve(&binding) else {
                warn!(topic = %record.topic, message_id = %record.message_id, "compensation scanner: compensator service could not be resolved");
                continue;
            };

            let message_id = record.message_id.clone();
            match compensator.compensate(&CompensationRecord::Producer(record)).await {
                Ok(true) => match self.outbox.mark_compensated(&message_id).await {
                    Ok(true) => {
                        compensated += 1;
                        debug!(message_id = %message_id, "compensation scanner: producer record compensated");
                    }
                    Ok(false) => warn!(message_id = %message_id, "compensation scanner: mark_compensated found no matching row"),
                    Err(err) => error!(message_id = %message_id, error = %err, "compensation scanner: mark_compensated failed"),
                },
                Ok(false) => error!(message_id = %message_id, "compensation scanner: producer compensator declined"),
                Err(err) => error!(message_id = %message_id, error = %err, "compensation scanner: producer compensator errored"),
            }
        }

        Ok(compensated)
    }

    /// Scan permanently-failed consumption records once. Symmetric to
    /// [`Self::check_producer`].
    pub async fn check_consumer(&self) -> ScannerResult<usize> {
        let records = self.idempotency.fetch_failed(self.config.batch_size).await?;
        let mut compensated = 0;

        for record in records {
            let topic = record.topic.clone().unwrap_or_default();
            let binding = self.consumer_compensators.lock().unwrap().get(&topic).cloned();
            let Some(binding) = binding else {
                warn!(topic = %topic, message_id = %record.message_id, "compensation scanner: no consumer compensator registered");
                continue;
            };
            let Some(compensator) = self.resolve(&binding) else {
                warn!(topic = %topic, message_id = %record.message_id, "compensation scanner: compensator service could not be resolved");
                continue;
            };

            let message_id = record.message_id.clone();
            match compensator.compensate(&CompensationRecord::Consumer(record)).await {
                Ok(true) => match self.idempotency.mark_compensated(&message_id).await {
                    Ok(true) => {
                        compensated += 1;
                        debug!(message_id = %message_id, "compensation scanner: consumer record compensated");
                    }
                    Ok(false) => warn!(message_id = %message_id, "compensation scanner: mark_compensated found no matching row"),
                    Err(err) => error!(message_id = %message_id, error = %err, "compensation scanner: mark_compensated failed"),
                },
                Ok(false) => error!(message_id = %message_id, "compensation scanner: consumer compensator declined"),
                Err(err) => error!(message_id = %message_id, error = %err, "compensation scanner: consumer compensator errored"),
            }
        }

        Ok(compensated)
    }

    /// Run `check_producer`/`check_consumer` on `config.poll_interval` until
    /// `max_iterations` is reached or `token` is cancelled.
    pub async fn run(&self, max_iterations: Option<u64>, token: CancellationToken) {
        let mut iterations: u64 = 0;
        loop {
            match self.check_producer().await {
                Ok(count) if count > 0 => info!(count, "compensation scanner: producer records compensated"),
                Ok(_) => {}
                Err(err) => error!(error = %err, "compensation scanner: producer scan failed"),
            }
            match self.check_consumer().await {
                Ok(count) if count > 0 => info!(count, "compensation scanner: consumer records compensated"),
                Ok(_) => {}
                Err(err) => error!(error = %err, "compensation scanner: consumer scan failed"),
            }

            iterations += 1;
            if let Some(max) = max_iterations {
                if iterations >= max {
                    break;
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use outbox_store::{OutboxStoreResult, OutboxStatus};
    use idempotency_store::{ConsumptionStatus, IdempotencyStoreResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn outbox_record(message_id: &str, topic: &str) -> OutboxRecord {
        OutboxRecord {
            message_id: message_id.to_string(),
            topic: topic.to_string(),
            data: "{}".to_string(),
            options: None,
            status: OutboxStatus::Failed,
            error: Some("max retry exceeded".to_string()),
            retry_count: 5,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    struct FakeOutbox {
        records: Mutex<HashMap<String, OutboxRecord>>,
    }

    impl FakeOutbox {
        fn with(records: Vec<OutboxRecord>) -> Self {
            Self {
                records: Mutex::new(records.into_iter().map(|r| (r.message_id.clone(), r)).collect()),
            }
        }
    }

    #[async_trait]
    impl OutboxStore for FakeOutbox {
        async fn begin(&self) -> OutboxStoreResult<()> {
            Ok(())
        }
        async fn commit(&self) -> OutboxStoreResult<bool> {
            Ok(true)
        }
        async fn rollback(&self) -> OutboxStoreResult<bool> {
            Ok(true)
        }
        async fn save(&self, _record: &outbox_store::NewOutboxRecord) -> OutboxStoreResult<()> {
            Ok(())
        }
        async fn fetch_pending(&self, _limit: i64) -> OutboxStoreResult<Vec<OutboxRecord>> {
            Ok(vec![])
        }
        async fn fetch_failed(&self, limit: i64) -> OutboxStoreResult<Vec<OutboxRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| matches!(r.status, OutboxStatus::Failed))
                .take(limit as usize)
                .cloned()
                .collect())
        }
        async fn mark_sent(&self, _message_id: &str) -> OutboxStoreResult<bool> {
            Ok(true)
        }
        async fn mark_failed(&self, _message_id: &str, _error_text: &str) -> OutboxStoreResult<bool> {
            Ok(true)
        }
        async fn mark_compensated(&self, message_id: &str) -> OutboxStoreResult<bool> {
            match self.records.lock().unwrap().get_mut(message_id) {
                Some(r) => {
                    r.status = OutboxStatus::Compensated;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        async fn increment_retry(&self, _message_id: &str) -> OutboxStoreResult<bool> {
            Ok(true)
        }
        async fn create_schema(&self) -> OutboxStoreResult<()> {
            Ok(())
        }
    }

    struct FakeIdempotency;

    #[async_trait]
    impl IdempotencyStore for FakeIdempotency {
        async fn is_processed(&self, _message_id: &str) -> IdempotencyStoreResult<bool> {
            Ok(false)
        }
        async fn mark_processing(&self, _message_id: &str, _topic: Option<&str>, _data: Option<&str>) -> IdempotencyStoreResult<()> {
            Ok(())
        }
        async fn mark_processed(&self, _message_id: &str) -> IdempotencyStoreResult<bool> {
            Ok(true)
        }
        async fn mark_failed(&self, _message_id: &str, _error_text: &str) -> IdempotencyStoreResult<bool> {
            Ok(true)
        }
        async fn mark_compensated(&self, _message_id: &str) -> IdempotencyStoreResult<bool> {
            Ok(true)
        }
        async fn fetch_failed(&self, _limit: i64) -> IdempotencyStoreResult<Vec<ConsumptionRecord>> {
            Ok(vec![])
        }
        async fn create_schema(&self) -> IdempotencyStoreResult<()> {
            Ok(())
        }
    }

    struct CountingCompensator {
        calls: Arc<AtomicUsize>,
        outcome: bool,
    }

    #[async_trait]
    impl Compensator for CountingCompensator {
        async fn compensate(&self, _record: &CompensationRecord) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome)
        }
    }

    #[tokio::test]
    async fn unregistered_topic_is_skipped_without_compensation() {
        let outbox = Arc::new(FakeOutbox::with(vec![outbox_record("m1", "orders.refund")]));
        let scanner = CompensationScanner::new(outbox.clone(), Arc::new(FakeIdempotency), ScannerConfig::default());

        let count = scanner.check_producer().await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn successful_compensation_marks_the_row_compensated() {
        let outbox = Arc::new(FakeOutbox::with(vec![outbox_record("m1", "orders.refund")]));
        let scanner = CompensationScanner::new(outbox.clone(), Arc::new(FakeIdempotency), ScannerConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        scanner.register_producer_compensator(
            "orders.refund",
            Arc::new(CountingCompensator { calls: calls.clone(), outcome: true }),
        );

        let count = scanner.check_producer().await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_compensated_row_is_not_scanned_again() {
        let outbox = Arc::new(FakeOutbox::with(vec![outbox_record("m1", "orders.refund")]));
        let scanner = CompensationScanner::new(outbox.clone(), Arc::new(FakeIdempotency), ScannerConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        scanner.register_producer_compensator(
            "orders.refund",
            Arc::new(CountingCompensator { calls: calls.clone(), outcome: true }),
        );

        scanner.check_producer().await.unwrap();
        let second_pass = scanner.check_producer().await.unwrap();

        assert_eq!(second_pass, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compensator_resolved_by_name_through_the_registry() {
        let outbox = Arc::new(FakeOutbox::with(vec![outbox_record("m1", "orders.refund")]));
        let registry = Arc::new(InProcessServiceRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            "refund-service",
            Arc::new(CountingCompensator { calls: calls.clone(), outcome: true }),
        );

        let scanner = CompensationScanner::new(outbox, Arc::new(FakeIdempotency), ScannerConfig::default())
            .with_registry(registry);
        scanner.register_producer_compensator_by_name("orders.refund", "refund-service");

        let count = scanner.check_producer().await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn run_stops_after_max_iterations() {
        let outbox = Arc::new(FakeOutbox::with(vec![]));
        let scanner = CompensationScanner::new(
            outbox,
            Arc::new(FakeIdempotency),
            ScannerConfig { batch_size: 10, poll_interval: Duration::from_millis(1) },
        );

        scanner.run(Some(2), CancellationToken::new()).await;
    }
}
