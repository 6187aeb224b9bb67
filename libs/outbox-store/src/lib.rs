//! Outbox Store: persistence and transaction-nesting for the transactional outbox.
//!
//! Owns the `mq_messages` table and the logical transaction-nesting counter
//! that lets a host application wrap a producer's local transaction inside
//! its own broader business transaction without opening two physical
//! transactions against the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

mod error;

pub use error::{OutboxStoreError, OutboxStoreResult};

/// Lifecycle state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
    Compensated,
}

impl OutboxStatus {
    fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Compensated => "compensated",
        }
    }

    fn parse(value: &str) -> OutboxStoreResult<Self> {
        match value {
            "pending" => Ok(OutboxStatus::Pending),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            "compensated" => Ok(OutboxStatus::Compensated),
            other => Err(OutboxStoreError::Other(anyhow::anyhow!(
                "unknown outbox status: {other}"
            ))),
        }
    }
}

/// A persisted row from `mq_messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub message_id: String,
    pub topic: String,
    pub data: String,
    pub options: Option<String>,
    pub status: OutboxStatus,
    pub error: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to stage a new outbox row. `message_id` generation is the
/// caller's responsibility (the Transactional Producer assigns a UUID v4).
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub message_id: String,
    pub topic: String,
    pub data: String,
    pub options: Option<String>,
}

/// Persistence and transaction-nesting contract for the outbox.
///
/// `begin`/`commit`/`rollback` implement nested logical transactions over a
/// single physical database transaction (see the module docs): the counter
/// transitions 0→1 open the real transaction, 1→0 commit it; rollback at any
/// depth tears the whole stack down. `commit`/`rollback` at depth 0 are soft
/// failures, not hard errors — callers that don't care can ignore the
/// `Ok(false)` result.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn begin(&self) -> OutboxStoreResult<()>;
    async fn commit(&self) -> OutboxStoreResult<bool>;
    async fn rollback(&self) -> OutboxStoreResult<bool>;

    /// Persist a new pending record. Must be called inside an open
    /// transaction (see `begin`); fails on duplicate `message_id` or I/O.
    async fn save(&self, record: &NewOutboxRecord) -> OutboxStoreResult<()>;

    /// Up to `limit` pending records, oldest `created_at` first.
    async fn fetch_pending(&self, limit: i64) -> OutboxStoreResult<Vec<OutboxRecord>>;

    /// Up to `limit` failed records, oldest `updated_at` first.
    async fn fetch_failed(&self, limit: i64) -> OutboxStoreResult<Vec<OutboxRecord>>;

    /// Transition `message_id` to `sent`. Idempotent: returns `false` (not an
    /// error) if no matching row exists.
    async fn mark_sent(&self, message_id: &str) -> OutboxStoreResult<bool>;

    /// Transition `message_id` to `failed` and record `error_text`. Idempotent.
    async fn mark_failed(&self, message_id: &str, error_text: &str) -> OutboxStoreResult<bool>;

    /// Transition `message_id` from `failed` to `compensated`. Idempotent.
    async fn mark_compensated(&self, message_id: &str) -> OutboxStoreResult<bool>;

    /// Increment the retry counter for `message_id`. Idempotent.
    async fn increment_retry(&self, message_id: &str) -> OutboxStoreResult<bool>;

    /// Reset a `failed` or `compensated` record back to `pending` with its
    /// retry counter cleared, for manual operator-triggered redelivery.
    /// Idempotent: `false` if no matching row exists in either state.
    async fn requeue(&self, message_id: &str) -> OutboxStoreResult<bool>;

    /// Create the `mq_messages` table if it doesn't already exist.
    async fn create_schema(&self) -> OutboxStoreResult<()>;
}

struct TxnState {
    depth: u32,
    tx: Option<Transaction<'static, Postgres>>,
}

/// SQLx/PostgreSQL implementation of [`OutboxStore`].
///
/// The nesting counter is instance-scoped (guarded by a `tokio::sync::Mutex`),
/// never process-global: concurrent producers must use separate
/// `SqlxOutboxStore` instances sharing the same pool.
pub struct SqlxOutboxStore {
    pool: PgPool,
    txn: Arc<Mutex<TxnState>>,
    debug: bool,
}

impl SqlxOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            txn: Arc::new(Mutex::new(TxnState { depth: 0, tx: None })),
            debug: false,
        }
    }

    /// Enable diagnostic logging of soft-failure commit/rollback calls.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[async_trait]
impl OutboxStore for SqlxOutboxStore {
    async fn begin(&self) -> OutboxStoreResult<()> {
        let mut state = self.txn.lock().await;
        if state.depth == 0 {
            let tx = self.pool.begin().await?;
            state.tx = Some(tx);
            debug!("outbox store: opened physical transaction");
        }
        state.depth += 1;
        debug!(depth = state.depth, "outbox store: begin");
        Ok(())
    }

    async fn commit(&self) -> OutboxStoreResult<bool> {
        let mut state = self.txn.lock().await;
        if state.depth == 0 {
            if self.debug {
                warn!("outbox store: commit() called with no open transaction");
            }
            return Ok(false);
        }

        state.depth -= 1;
        if state.depth == 0 {
            let tx = state
                .tx
                .take()
                .expect("transaction present at depth transition 1 -> 0");
            tx.commit().await?;
            debug!("outbox store: committed physical transaction");
        } else {
            debug!(depth = state.depth, "outbox store: inner commit is a no-op");
        }
        Ok(true)
    }

    async fn rollback(&self) -> OutboxStoreResult<bool> {
        let mut state = self.txn.lock().await;
        if state.depth == 0 {
            if self.debug {
                warn!("outbox store: rollback() called with no open transaction");
            }
            return Ok(false);
        }

        state.depth = 0;
        if let Some(tx) = state.tx.take() {
            tx.rollback().await?;
            debug!("outbox store: rolled back physical transaction (all nested levels)");
        }
        Ok(true)
    }

    async fn save(&self, record: &NewOutboxRecord) -> OutboxStoreResult<()> {
        let mut state = self.txn.lock().await;
        let tx = state.tx.as_mut().ok_or(OutboxStoreError::NoTransaction)?;

        sqlx::query(
            r#"
            INSERT INTO mq_messages (message_id, topic, data, options, status, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, NOW(), NOW())
            "#,
        )
        .bind(&record.message_id)
        .bind(&record.topic)
        .bind(&record.data)
        .bind(&record.options)
        .execute(&mut **tx)
        .await?;

        debug!(message_id = %record.message_id, topic = %record.topic, "outbox store: staged record");
        Ok(())
    }

    async fn fetch_pending(&self, limit: i64) -> OutboxStoreResult<Vec<OutboxRecord>> {
        fetch_by_status(&self.pool, "pending", "created_at", limit).await
    }

    async fn fetch_failed(&self, limit: i64) -> OutboxStoreResult<Vec<OutboxRecord>> {
        fetch_by_status(&self.pool, "failed", "updated_at", limit).await
    }

    async fn mark_sent(&self, message_id: &str) -> OutboxStoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mq_messages
            SET status = 'sent', updated_at = NOW()
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, message_id: &str, error_text: &str) -> OutboxStoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mq_messages
            SET status = 'failed', error = $2, updated_at = NOW()
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(error_text)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_compensated(&self, message_id: &str) -> OutboxStoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mq_messages
            SET status = 'compensated', updated_at = NOW()
            WHERE message_id = $1 AND status = 'failed'
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_retry(&self, message_id: &str) -> OutboxStoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mq_messages
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue(&self, message_id: &str) -> OutboxStoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mq_messages
            SET status = 'pending', retry_count = 0, error = NULL, updated_at = NOW()
            WHERE message_id = $1 AND status IN ('failed', 'compensated')
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_schema(&self) -> OutboxStoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mq_messages (
                id BIGSERIAL PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                topic TEXT NOT NULL,
                data TEXT NOT NULL,
                options TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mq_messages_status_created ON mq_messages (status, created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

async fn fetch_by_status(
    pool: &PgPool,
    status: &str,
    order_column: &str,
    limit: i64,
) -> OutboxStoreResult<Vec<OutboxRecord>> {
    // order_column is one of two hardcoded literals from this module, never
    // caller input; limit is always bound as a typed parameter below.
    let query = format!(
        r#"
        SELECT message_id, topic, data, options, status, error, retry_count, created_at, updated_at
        FROM mq_messages
        WHERE status = $1
        ORDER BY {order_column} ASC
        LIMIT $2
        "#
    );

    let rows = sqlx::query(&query)
        .bind(status)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.into_iter()
        .map(|row| {
            let status_str: String = row.try_get("status")?;
            Ok(OutboxRecord {
                message_id: row.try_get("message_id")?,
                topic: row.try_get("topic")?,
                data: row.try_get("data")?,
                options: row.try_get("options")?,
                status: OutboxStatus::parse(&status_str)?,
                error: row.try_get("error")?,
                retry_count: row.try_get("retry_count")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .collect()
}
