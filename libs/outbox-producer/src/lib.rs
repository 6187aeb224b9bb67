//! Transactional Producer: stage outbox messages in memory inside a local
//! transaction, then persist and commit them atomically alongside the
//! host's own business writes.
//!
//! `begin`/`prepare`/`commit`/`rollback` track a simple `{idle, in_txn}`
//! state machine per producer instance. A producer is per-request and must
//! not be shared across concurrent callers — see [`outbox_store::OutboxStore`]
//! for why the underlying transaction counter is instance-scoped.

use chrono::Utc;
use outbox_store::{NewOutboxRecord, OutboxStore};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

mod error;

pub use error::{ProducerError, ProducerResult};

/// A message staged in memory, not yet durable. Discarded on rollback;
/// flushed under the host transaction on `commit`.
#[derive(Debug, Clone)]
pub struct StagedMessage {
    pub message_id: String,
    pub topic: String,
    pub data: String,
    pub options: Option<String>,
}

enum ProducerState {
    Idle,
    InTransaction(Vec<StagedMessage>),
}

/// Stages messages in memory during a transaction and flushes them to the
/// [`OutboxStore`] on commit, under the same physical transaction as
/// whatever business writes the host application performs alongside it.
pub struct TransactionalProducer<S: OutboxStore> {
    store: Arc<S>,
    state: Mutex<ProducerState>,
}

impl<S: OutboxStore> TransactionalProducer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            state: Mutex::new(ProducerState::Idle),
        }
    }

    /// Open a local transaction. Fails if one is already open on this
    /// instance; the host may still be nesting this inside its own broader
    /// transaction via the store's counter (see `OutboxStore::begin`).
    pub async fn begin(&self) -> ProducerResult<()> {
        let mut state = self.state.lock().await;
        if matches!(*state, ProducerState::InTransaction(_)) {
            return Err(ProducerError::AlreadyInTransaction);
        }
        self.store.begin().await?;
        *state = ProducerState::InTransaction(Vec::new());
        Ok(())
    }

    /// Stage a message for publication under `topic`. `payload` is
    /// serialized to JSON; `options` is an opaque JSON mapping of
    /// per-message hints passed through to the broker adapter untouched.
    /// Returns the freshly generated `message_id` — the spine of
    /// deduplication downstream.
    pub async fn prepare<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        options: Option<serde_json::Value>,
    ) -> ProducerResult<String> {
        let data = serde_json::to_string(payload)
            .map_err(|err| ProducerError::Store(outbox_store::OutboxStoreError::Serialization(err)))?;
        let options = options
            .map(|value| serde_json::to_string(&value))
            .transpose()
            .map_err(|err| ProducerError::Store(outbox_store::OutboxStoreError::Serialization(err)))?;
        self.prepare_raw(topic, data, options).await
    }

    /// Lower-level variant of [`Self::prepare`] taking pre-serialized
    /// strings, for callers that already hold encoded bytes.
    pub async fn prepare_raw(
        &self,
        topic: &str,
        data: String,
        options: Option<String>,
    ) -> ProducerResult<String> {
        let mut state = self.state.lock().await;
        let staged = match &mut *state {
            ProducerState::InTransaction(staged) => staged,
            ProducerState::Idle => return Err(ProducerError::NotInTransaction),
        };

        let message_id = Uuid::new_v4().to_string();
        staged.push(StagedMessage {
            message_id: message_id.clone(),
            topic: topic.to_string(),
            data,
            options,
        });

        debug!(message_id = %message_id, topic = %topic, "producer: staged message");
        Ok(message_id)
    }

    /// Persist every staged message and commit the underlying transaction.
    ///
    /// On any save failure, the whole batch (and the host's broader DB
    /// transaction) is rolled back and `SaveFailed` is surfaced; on success
    /// every staged message is durably visible as `pending`. Returns the
    /// number of messages committed.
    pub async fn commit(&self) -> ProducerResult<usize> {
        let mut state = self.state.lock().await;
        let staged = match std::mem::replace(&mut *state, ProducerState::Idle) {
            ProducerState::InTransaction(staged) => staged,
            ProducerState::Idle => return Err(ProducerError::NotInTransaction),
        };

        for message in &staged {
            let record = NewOutboxRecord {
                message_id: message.message_id.clone(),
                topic: message.topic.clone(),
                data: message.data.clone(),
                options: message.options.clone(),
            };
            if let Err(source) = self.store.save(&record).await {
                warn!(
                    message_id = %message.message_id,
                    error = %source,
                    "producer: save failed, rolling back entire batch"
                );
                let _ = self.store.rollback().await;
                return Err(ProducerError::SaveFailed {
                    message_id: message.message_id.clone(),
                    source,
                });
            }
        }

        self.store.commit().await?;
        debug!(count = staged.len(), "producer: committed staged messages");
        Ok(staged.len())
    }

    /// Roll back the current transaction, discarding all staged messages.
    /// Idempotent: safe to call as cleanup after a failed `commit()`, where
    /// the state has already reverted to idle.
    pub async fn rollback(&self) -> ProducerResult<()> {
        let mut state = self.state.lock().await;
        if matches!(*state, ProducerState::Idle) {
            // Already idle (e.g. commit() already rolled back on failure).
            return Ok(());
        }
        *state = ProducerState::Idle;
        self.store.rollback().await?;
        Ok(())
    }
}
