//! Partitioned-log broker adapter over `rdkafka`.
//!
//! Mirrors the producer configuration the teacher's `KafkaOutboxPublisher`/
//! `IdentityOutboxPublisher` require (idempotent producer, `acks = all`) and
//! wraps every I/O call in a [`resilience::CircuitBreaker`] the way
//! `identity-service`/`social-service` wrap their Kafka publishers.
//!
//! `nack` has no native meaning for a partitioned log: per the adapter
//! contract, it is implemented as "do not advance the commit offset" —
//! the message is redelivered on the next rebalance or consumer restart.

use crate::{ConsumeCallback, ConsumerEnvelope, RawHandle, SendOutcome};
use async_trait::async_trait;
use futures_util::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message, TopicPartitionList};
use resilience::CircuitBreaker;
use std::time::Duration;
use tracing::{error, warn};

struct KafkaHandle {
    topic: String,
    partition: i32,
    offset: i64,
}

/// Kafka-backed [`crate::BrokerAdapter`].
pub struct KafkaBrokerAdapter {
    producer: FutureProducer,
    consumer: StreamConsumer,
    send_breaker: CircuitBreaker,
}

impl KafkaBrokerAdapter {
    /// `brokers` is a comma-separated `host:port` list; `group_id` controls
    /// consumer-group offset tracking.
    pub fn new(brokers: &str, client_id: &str, group_id: &str) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("retries", "3")
            .create()?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("client.id", client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        Ok(Self {
            producer,
            consumer,
            send_breaker: CircuitBreaker::new(resilience::presets::kafka_config().circuit_breaker),
        })
    }
}

#[async_trait]
impl crate::BrokerAdapter for KafkaBrokerAdapter {
    async fn send(
        &self,
        topic: &str,
        payload: &[u8],
        message_id: &str,
        _options: Option<&str>,
    ) -> SendOutcome {
        let result = self
            .send_breaker
            .call(|| async {
                let record = FutureRecord::to(topic).key(message_id).payload(payload);
                self.producer
                    .send(record, Duration::from_secs(10))
                    .await
                    .map_err(|(err, _)| err.to_string())
            })
            .await;

        match result {
            Ok(_) => SendOutcome::Delivered,
            Err(resilience::CircuitBreakerError::Open) => {
                SendOutcome::Transient("circuit breaker open".to_string())
            }
            Err(resilience::CircuitBreakerError::CallFailed(msg)) => {
                SendOutcome::Transient(msg)
            }
        }
    }

    async fn consume(&self, topics: Vec<String>, callback: ConsumeCallback) -> anyhow::Result<()> {
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topic_refs)?;

        let mut stream = self.consumer.stream();
        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "kafka consumer stream error, retrying after backoff");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let message_id = message.key().map(|k| String::from_utf8_lossy(k).into_owned());
            let payload = message.payload().unwrap_or_default().to_vec();
            let envelope = ConsumerEnvelope {
                message_id,
                topic: message.topic().to_string(),
                payload,
                raw_handle: RawHandle::new(KafkaHandle {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                }),
            };

            let ok = callback(envelope).await;
            if ok {
                let mut tpl = TopicPartitionList::new();
                tpl.add_partition_offset(
                    message.topic(),
                    message.partition(),
                    rdkafka::Offset::Offset(message.offset() + 1),
                )?;
                if let Err(err) = self.consumer.commit(&tpl, CommitMode::Async) {
                    error!(error = %err, "failed to commit kafka offset");
                }
            }
        }

        Ok(())
    }

    async fn ack(&self, handle: RawHandle) -> anyhow::Result<()> {
        let handle: KafkaHandle = handle.downcast()?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &handle.topic,
            handle.partition,
            rdkafka::Offset::Offset(handle.offset + 1),
        )?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }

    async fn nack(&self, handle: RawHandle, _requeue: bool) -> anyhow::Result<()> {
        let handle: KafkaHandle = handle.downcast()?;
        warn!(
            topic = %handle.topic,
            partition = handle.partition,
            offset = handle.offset,
            "nack: leaving kafka offset uncommitted for redelivery"
        );
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
