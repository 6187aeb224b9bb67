//! Uniform interface over concrete message brokers: publish, subscribe, ack, nack, close.
//!
//! Broker-specific types never leak past this crate's boundary. A
//! [`ConsumerEnvelope`]'s `raw_handle` is opaque to the dispatcher/consumer —
//! only the adapter that produced it knows how to interpret it, so `ack`/
//! `nack` calls are routed back through the same adapter instance.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

mod error;
pub mod amqp;
pub mod kafka;
pub mod memory;

pub use error::BrokerAdapterError;

/// Result of a [`BrokerAdapter::send`] attempt.
///
/// Splitting "the broker said no" from "the broker didn't answer in time"
/// lets the dispatcher decide whether a retry is worth the attempt: a
/// rejected payload will never succeed on replay, a transient failure might.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The broker accepted and durably stored the message.
    Delivered,
    /// The broker refused the message outright (e.g. validation, unknown
    /// topic, payload too large). Retrying unchanged bytes will not help.
    Rejected(String),
    /// The send could not be confirmed (timeout, connection drop, broker
    /// unavailable). Worth retrying.
    Transient(String),
}

impl SendOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}

/// Opaque broker-specific acknowledgment token. Only the adapter that
/// produced it can interpret the boxed value; callers must treat it as a
/// black box and hand it back unchanged to `ack`/`nack`.
pub struct RawHandle(pub Box<dyn Any + Send>);

impl RawHandle {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast<T: Any + Send>(self) -> Result<T, BrokerAdapterError> {
        self.0
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| BrokerAdapterError::ForeignHandle)
    }
}

/// A single incoming delivery handed to the consumer's callback.
pub struct ConsumerEnvelope {
    pub message_id: Option<String>,
    pub topic: String,
    pub payload: Vec<u8>,
    pub raw_handle: RawHandle,
}

/// Callback invoked per delivery; the returned bool decides ack (`true`) vs
/// nack (`false`). Boxed-future-behind-an-Arc is the teacher's idiom for
/// dynamic async dispatch across a handler registry.
pub type ConsumeCallback = Arc<dyn Fn(ConsumerEnvelope) -> BoxFuture<'static, bool> + Send + Sync>;

/// Polymorphic surface over {AMQP-style topic broker, partitioned log
/// broker, in-memory test double, any future concrete adapter}.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Best-effort synchronous publish. Must be safe to call concurrently.
    async fn send(
        &self,
        topic: &str,
        payload: &[u8],
        message_id: &str,
        options: Option<&str>,
    ) -> SendOutcome;

    /// Blocking subscription; invokes `callback` per delivery until the
    /// adapter is closed. The adapter owns its own reconnect/backoff policy.
    async fn consume(&self, topics: Vec<String>, callback: ConsumeCallback) -> anyhow::Result<()>;

    /// Explicit acknowledgment of a successfully processed delivery.
    async fn ack(&self, handle: RawHandle) -> anyhow::Result<()>;

    /// Explicit negative acknowledgment. `requeue` is a hint; log-style
    /// brokers without a real nack MAY implement this as "do not advance the
    /// commit offset" rather than an immediate requeue.
    async fn nack(&self, handle: RawHandle, requeue: bool) -> anyhow::Result<()>;

    /// Release underlying resources. Idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}
