//! AMQP topic-broker adapter over `lapin`.
//!
//! Mirrors the Kafka adapter's shape (circuit-breaker-wrapped `send`,
//! opaque `raw_handle` carrying enough to ack/nack against the original
//! channel) but speaks to a RabbitMQ-style exchange/queue topology instead
//! of a partitioned log: `send` publishes to a topic exchange keyed by
//! `topic`, `consume` declares one queue per topic bound to that exchange.

use crate::{ConsumeCallback, ConsumerEnvelope, RawHandle, SendOutcome};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use resilience::CircuitBreaker;
use tracing::warn;

const EXCHANGE: &str = "mq_messages";

struct AmqpHandle {
    delivery_tag: u64,
}

/// RabbitMQ-backed [`crate::BrokerAdapter`].
pub struct AmqpBrokerAdapter {
    channel: Channel,
    send_breaker: CircuitBreaker,
}

impl AmqpBrokerAdapter {
    /// `uri` is an `amqp://` connection string.
    pub async fn connect(uri: &str) -> anyhow::Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Self {
            channel,
            send_breaker: CircuitBreaker::new(resilience::presets::kafka_config().circuit_breaker),
        })
    }
}

#[async_trait]
impl crate::BrokerAdapter for AmqpBrokerAdapter {
    async fn send(
        &self,
        topic: &str,
        payload: &[u8],
        message_id: &str,
        _options: Option<&str>,
    ) -> SendOutcome {
        let properties = BasicProperties::default()
            .with_message_id(message_id.into())
            .with_delivery_mode(2); // persistent

        let result = self
            .send_breaker
            .call(|| async {
                self.channel
                    .basic_publish(
                        EXCHANGE,
                        topic,
                        BasicPublishOptions::default(),
                        payload,
                        properties.clone(),
                    )
                    .await
                    .map_err(|err| err.to_string())?
                    .await
                    .map_err(|err| err.to_string())
            })
            .await;

        match result {
            Ok(_) => SendOutcome::Delivered,
            Err(resilience::CircuitBreakerError::Open) => {
                SendOutcome::Transient("circuit breaker open".to_string())
            }
            Err(resilience::CircuitBreakerError::CallFailed(msg)) => SendOutcome::Transient(msg),
        }
    }

    async fn consume(&self, topics: Vec<String>, callback: ConsumeCallback) -> anyhow::Result<()> {
        let mut streams = Vec::new();
        for topic in &topics {
            let queue_name = format!("mq_messages.{topic}");
            self.channel
                .queue_declare(
                    &queue_name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            self.channel
                .queue_bind(
                    &queue_name,
                    EXCHANGE,
                    topic,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            let consumer = self
                .channel
                .basic_consume(
                    &queue_name,
                    &format!("mq-consumer-{topic}"),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            streams.push((topic.clone(), consumer));
        }

        let mut merged = futures_util::stream::select_all(
            streams
                .into_iter()
                .map(|(topic, consumer)| consumer.map(move |item| (topic.clone(), item))),
        );

        while let Some((topic, delivery)) = merged.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!(error = %err, "amqp consumer stream error, retrying after backoff");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let message_id = delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.to_string());
            let delivery_tag = delivery.delivery_tag;
            let envelope = ConsumerEnvelope {
                message_id,
                topic,
                payload: delivery.data.clone(),
                raw_handle: RawHandle::new(AmqpHandle { delivery_tag }),
            };

            let ok = callback(envelope).await;
            let ack_result = if ok {
                delivery.ack(BasicAckOptions::default()).await
            } else {
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            };
            if let Err(err) = ack_result {
                warn!(error = %err, "failed to ack/nack amqp delivery");
            }
        }

        Ok(())
    }

    async fn ack(&self, handle: RawHandle) -> anyhow::Result<()> {
        let handle: AmqpHandle = handle.downcast()?;
        self.channel
            .basic_ack(handle.delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, handle: RawHandle, requeue: bool) -> anyhow::Result<()> {
        let handle: AmqpHandle = handle.downcast()?;
        self.channel
            .basic_nack(
                handle.delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.channel.close(200, "closing").await?;
        Ok(())
    }
}
