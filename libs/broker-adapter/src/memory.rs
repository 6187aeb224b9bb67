//! In-process broker adapter used by tests and local development. No
//! network I/O, no persistence across process restarts.

use crate::{ConsumeCallback, ConsumerEnvelope, RawHandle, SendOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

struct Delivery {
    message_id: Option<String>,
    topic: String,
    payload: Vec<u8>,
}

/// Handle returned to `ack`/`nack`; carries the delivery back so `nack` with
/// `requeue = true` can reinsert it.
struct MemoryHandle {
    topic: String,
    delivery: Delivery,
}

/// An in-memory, single-process [`crate::BrokerAdapter`] backed by one
/// unbounded channel per topic.
pub struct InMemoryBrokerAdapter {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    closed: AtomicBool,
}

impl InMemoryBrokerAdapter {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn sender_for(&self, topic: &str) -> mpsc::UnboundedSender<Delivery> {
        let mut senders = self.senders.lock().unwrap();
        senders
            .entry(topic.to_string())
            .or_insert_with(|| {
                let (tx, _rx) = mpsc::unbounded_channel();
                tx
            })
            .clone()
    }
}

impl Default for InMemoryBrokerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::BrokerAdapter for InMemoryBrokerAdapter {
    async fn send(
        &self,
        topic: &str,
        payload: &[u8],
        message_id: &str,
        _options: Option<&str>,
    ) -> SendOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return SendOutcome::Transient("adapter is closed".to_string());
        }

        let delivery = Delivery {
            message_id: Some(message_id.to_string()),
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };

        match self.sender_for(topic).send(delivery) {
            Ok(()) => SendOutcome::Delivered,
            Err(_) => SendOutcome::Transient("no active consumer for topic".to_string()),
        }
    }

    async fn consume(&self, topics: Vec<String>, callback: ConsumeCallback) -> anyhow::Result<()> {
        let mut receivers = Vec::new();
        {
            let mut senders = self.senders.lock().unwrap();
            for topic in topics {
                let rx = if let Some(existing) = senders.get(&topic) {
                    // Re-subscribing on a topic that already has a sender replaces
                    // it so the new receiver actually gets future deliveries.
                    let (tx, rx) = mpsc::unbounded_channel();
                    drop(existing);
                    senders.insert(topic.clone(), tx);
                    rx
                } else {
                    let (tx, rx) = mpsc::unbounded_channel();
                    senders.insert(topic.clone(), tx);
                    rx
                };
                receivers.push(rx);
            }
        }

        let mut merged = futures_util::stream::select_all(
            receivers
                .into_iter()
                .map(tokio_stream_from_receiver)
                .collect::<Vec<_>>(),
        );

        use futures_util::StreamExt;
        while let Some(delivery) = merged.next().await {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let envelope = ConsumerEnvelope {
                message_id: delivery.message_id.clone(),
                topic: delivery.topic.clone(),
                payload: delivery.payload.clone(),
                raw_handle: RawHandle::new(MemoryHandle {
                    topic: delivery.topic.clone(),
                    delivery,
                }),
            };
            let ok = callback(envelope).await;
            debug!(ok, "in-memory adapter delivered message");
        }

        Ok(())
    }

    async fn ack(&self, handle: RawHandle) -> anyhow::Result<()> {
        let _: MemoryHandle = handle.downcast()?;
        Ok(())
    }

    async fn nack(&self, handle: RawHandle, requeue: bool) -> anyhow::Result<()> {
        let handle: MemoryHandle = handle.downcast()?;
        if requeue {
            let _ = self.sender_for(&handle.topic).send(handle.delivery);
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn tokio_stream_from_receiver(
    rx: mpsc::UnboundedReceiver<Delivery>,
) -> tokio_stream::wrappers::UnboundedReceiverStream<Delivery> {
    tokio_stream::wrappers::UnboundedReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BrokerAdapter;
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn send_without_a_consumer_is_transient() {
        let adapter = InMemoryBrokerAdapter::new();
        let outcome = adapter.send("topic.a", b"hi", "m1", None).await;
        assert!(matches!(outcome, SendOutcome::Transient(_)));
    }

    #[tokio::test]
    async fn a_sent_message_reaches_the_consumer_callback() {
        let adapter = Arc::new(InMemoryBrokerAdapter::new());
        let received = Arc::new(Notify::new());
        let received_clone = received.clone();

        let adapter_for_consume = adapter.clone();
        let handle = tokio::spawn(async move {
            adapter_for_consume
                .consume(
                    vec!["topic.a".to_string()],
                    Arc::new(move |envelope: ConsumerEnvelope| {
                        let received = received_clone.clone();
                        Box::pin(async move {
                            assert_eq!(envelope.payload, b"hi");
                            received.notify_one();
                            true
                        })
                    }),
                )
                .await
        });

        // Give the consumer a moment to register its channel before sending.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let outcome = adapter.send("topic.a", b"hi", "m1", None).await;
        assert_eq!(outcome, SendOutcome::Delivered);

        received.notified().await;
        adapter.close().await.unwrap();
        let _ = handle.await;
    }
}
