//! Event Consumer: routes incoming broker deliveries to registered handlers
//! under the idempotency ledger, so at-least-once broker delivery becomes
//! effectively-once handler invocation.
//!
//! `handlers` is a topic → callable registry; the teacher's boxed-future-
//! behind-an-`Arc` idiom is used again here for dynamic async dispatch,
//! matching [`broker_adapter::ConsumeCallback`]. Registration is additive
//! and not meant to happen concurrently with `start()`.

use broker_adapter::{BrokerAdapter, ConsumerEnvelope};
use futures_util::future::BoxFuture;
use idempotency_store::IdempotencyStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// A registered handler: takes the envelope, returns whether it applied
/// cleanly. `Err` is treated the same as the spec's "on exception" case.
pub type HandlerFn =
    Arc<dyn Fn(ConsumerEnvelope) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Routes incoming deliveries to per-topic handlers, recording outcomes in
/// the idempotency ledger before and after each invocation.
pub struct EventConsumer<I: IdempotencyStore, B: BrokerAdapter> {
    idempotency: Arc<I>,
    broker: Arc<B>,
    handlers: Mutex<HashMap<String, HandlerFn>>,
}

impl<I: IdempotencyStore + 'static, B: BrokerAdapter + 'static> EventConsumer<I, B> {
    pub fn new(idempotency: Arc<I>, broker: Arc<B>) -> Self {
        Self {
            idempotency,
            broker,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler for `topic`. Additive only — there is no
    /// `unregister`; re-registering the same topic replaces its handler.
    pub fn register(&self, topic: impl Into<String>, handler: HandlerFn) {
        self.handlers.lock().unwrap().insert(topic.into(), handler);
    }

    /// Process one delivery. Returns the ack (`true`) / nack (`false`)
    /// decision the broker adapter acts on.
    pub async fn process(&self, envelope: ConsumerEnvelope) -> bool {
        let message_id = match envelope.message_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                warn!("event consumer: invalid format — missing message_id");
                return false;
            }
        };
        if envelope.topic.is_empty() {
            warn!(message_id = %message_id, "event consumer: invalid format — missing topic");
            return false;
        }

        match self.idempotency.is_processed(&message_id).await {
            Ok(true) => {
                debug!(message_id = %message_id, "event consumer: already processed, acking without invoking handler");
                return true;
            }
            Ok(false) => {}
            Err(err) => {
                error!(message_id = %message_id, error = %err, "event consumer: is_processed check failed");
                return false;
            }
        }

        let handler = {
            let handlers = self.handlers.lock().unwrap();
            handlers.get(&envelope.topic).cloned()
        };
        let Some(handler) = handler else {
            warn!(topic = %envelope.topic, message_id = %message_id, "event consumer: no handler registered");
            return false;
        };

        let payload_str = String::from_utf8(envelope.payload.clone()).ok();
        if let Err(err) = self
            .idempotency
            .mark_processing(&message_id, Some(&envelope.topic), payload_str.as_deref())
            .await
        {
            error!(message_id = %message_id, error = %err, "event consumer: mark_processing failed");
            return false;
        }

        match handler(envelope).await {
            Ok(true) => {
                if let Err(err) = self.idempotency.mark_processed(&message_id).await {
                    error!(message_id = %message_id, error = %err, "event consumer: mark_processed failed");
                }
                true
            }
            Ok(false) => {
                if let Err(err) = self
                    .idempotency
                    .mark_failed(&message_id, "handler returned false")
                    .await
                {
                    error!(message_id = %message_id, error = %err, "event consumer: mark_failed failed");
                }
                false
            }
            Err(handler_error) => {
                if let Err(err) = self
                    .idempotency
                    .mark_failed(&message_id, &handler_error.to_string())
                    .await
                {
                    error!(message_id = %message_id, error = %err, "event consumer: mark_failed failed");
                }
                false
            }
        }
    }

    /// Subscribe to `topics` (defaulting to every registered handler's
    /// topic) and block until the broker adapter's consume loop
    /// terminates, routing each delivery through [`Self::process`].
    pub async fn start(self: &Arc<Self>, topics: Option<Vec<String>>) -> anyhow::Result<()> {
        let topics = topics.unwrap_or_else(|| {
            self.handlers.lock().unwrap().keys().cloned().collect()
        });

        let this = self.clone();
        let callback: broker_adapter::ConsumeCallback = Arc::new(move |envelope| {
            let this = this.clone();
            Box::pin(async move { this.process(envelope).await })
        });

        self.broker.consume(topics, callback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_adapter::RawHandle;
    use idempotency_store::{ConsumptionRecord, IdempotencyStoreResult};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeLedger {
        rows: StdMutex<StdHashMap<String, ConsumptionRecord>>,
    }

    impl FakeLedger {
        fn new() -> Self {
            Self {
                rows: StdMutex::new(StdHashMap::new()),
            }
        }

        fn status_of(&self, id: &str) -> Option<idempotency_store::ConsumptionStatus> {
            self.rows.lock().unwrap().get(id).map(|r| r.status)
        }
    }

    #[async_trait]
    impl IdempotencyStore for FakeLedger {
        async fn is_processed(&self, message_id: &str) -> IdempotencyStoreResult<bool> {
            Ok(matches!(
                self.rows.lock().unwrap().get(message_id).map(|r| r.status),
                Some(idempotency_store::ConsumptionStatus::Processed)
            ))
        }

        async fn mark_processing(
            &self,
            message_id: &str,
            topic: Option<&str>,
            data: Option<&str>,
        ) -> IdempotencyStoreResult<()> {
            let mut rows = self.rows.lock().unwrap();
            rows.entry(message_id.to_string())
                .and_modify(|r| r.status = idempotency_store::ConsumptionStatus::Processing)
                .or_insert(ConsumptionRecord {
                    message_id: message_id.to_string(),
                    topic: topic.map(String::from),
                    data: data.map(String::from),
                    status: idempotency_store::ConsumptionStatus::Processing,
                    error: None,
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                });
            Ok(())
        }

        async fn mark_processed(&self, message_id: &str) -> IdempotencyStoreResult<bool> {
            match self.rows.lock().unwrap().get_mut(message_id) {
                Some(r) => {
                    r.status = idempotency_store::ConsumptionStatus::Processed;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn mark_failed(&self, message_id: &str, error_text: &str) -> IdempotencyStoreResult<bool> {
            match self.rows.lock().unwrap().get_mut(message_id) {
                Some(r) => {
                    r.status = idempotency_store::ConsumptionStatus::Failed;
                    r.error = Some(error_text.to_string());
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn mark_compensated(&self, message_id: &str) -> IdempotencyStoreResult<bool> {
            match self.rows.lock().unwrap().get_mut(message_id) {
                Some(r) if r.status == idempotency_store::ConsumptionStatus::Failed => {
                    r.status = idempotency_store::ConsumptionStatus::Compensated;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn fetch_failed(&self, limit: i64) -> IdempotencyStoreResult<Vec<ConsumptionRecord>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.status == idempotency_store::ConsumptionStatus::Failed)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn create_schema(&self) -> IdempotencyStoreResult<()> {
            Ok(())
        }
    }

    struct NoopBroker;

    #[async_trait]
    impl BrokerAdapter for NoopBroker {
        async fn send(
            &self,
            _topic: &str,
            _payload: &[u8],
            _message_id: &str,
            _options: Option<&str>,
        ) -> broker_adapter::SendOutcome {
            broker_adapter::SendOutcome::Delivered
        }
        async fn consume(
            &self,
            _topics: Vec<String>,
            _callback: broker_adapter::ConsumeCallback,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn ack(&self, _handle: RawHandle) -> anyhow::Result<()> {
            Ok(())
        }
        async fn nack(&self, _handle: RawHandle, _requeue: bool) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn envelope(message_id: Option<&str>, topic: &str) -> ConsumerEnvelope {
        ConsumerEnvelope {
            message_id: message_id.map(String::from),
            topic: topic.to_string(),
            payload: b"{}".to_vec(),
            raw_handle: RawHandle::new(()),
        }
    }

    fn consumer() -> Arc<EventConsumer<FakeLedger, NoopBroker>> {
        Arc::new(EventConsumer::new(
            Arc::new(FakeLedger::new()),
            Arc::new(NoopBroker),
        ))
    }

    #[tokio::test]
    async fn envelope_missing_message_id_is_rejected_without_ledger_mutation() {
        let consumer = consumer();
        let ok = consumer.process(envelope(None, "t")).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn envelope_missing_topic_is_rejected() {
        let consumer = consumer();
        let ok = consumer.process(envelope(Some("m1"), "")).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn no_handler_registered_returns_false() {
        let consumer = consumer();
        let ok = consumer.process(envelope(Some("m1"), "unhandled")).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn successful_handler_marks_processed_and_acks() {
        let consumer = consumer();
        consumer.register(
            "order.created",
            Arc::new(|_env| Box::pin(async { Ok(true) })),
        );

        let ok = consumer.process(envelope(Some("m1"), "order.created")).await;
        assert!(ok);
        assert_eq!(
            consumer.idempotency.status_of("m1"),
            Some(idempotency_store::ConsumptionStatus::Processed)
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_is_acked_without_invoking_the_handler_again() {
        let consumer = consumer();
        let invocations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = invocations.clone();
        consumer.register(
            "t",
            Arc::new(move |_env| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Box::pin(async { Ok(true) })
            }),
        );

        assert!(consumer.process(envelope(Some("m1"), "t")).await);
        assert!(consumer.process(envelope(Some("m1"), "t")).await);
        assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_exception_marks_failed_with_the_error_message() {
        let consumer = consumer();
        consumer.register(
            "x",
            Arc::new(|_env| Box::pin(async { Err(anyhow::anyhow!("boom")) })),
        );

        let ok = consumer.process(envelope(Some("m1"), "x")).await;
        assert!(!ok);
        let rows = consumer.idempotency.rows.lock().unwrap();
        assert_eq!(rows["m1"].error.as_deref(), Some("boom"));
    }
}
