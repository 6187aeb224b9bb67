//! Idempotency Store: the durable consumer ledger behind exactly-once-apply
//! semantics for at-least-once broker delivery.
//!
//! Owns the `mq_consumption_records` table. `mark_processing` is the only
//! write capable of creating a row; every other transition only acts on an
//! existing row, and `status = processed` is terminal for delivery purposes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::debug;

mod error;

pub use error::{IdempotencyStoreError, IdempotencyStoreResult};

/// Lifecycle state of a consumption record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumptionStatus {
    Processing,
    Processed,
    Failed,
    Compensated,
}

impl ConsumptionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ConsumptionStatus::Processing => "processing",
            ConsumptionStatus::Processed => "processed",
            ConsumptionStatus::Failed => "failed",
            ConsumptionStatus::Compensated => "compensated",
        }
    }

    fn parse(value: &str) -> IdempotencyStoreResult<Self> {
        match value {
            "processing" => Ok(ConsumptionStatus::Processing),
            "processed" => Ok(ConsumptionStatus::Processed),
            "failed" => Ok(ConsumptionStatus::Failed),
            "compensated" => Ok(ConsumptionStatus::Compensated),
            other => Err(IdempotencyStoreError::Other(anyhow::anyhow!(
                "unknown consumption status: {other}"
            ))),
        }
    }
}

/// A persisted row from `mq_consumption_records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub message_id: String,
    pub topic: Option<String>,
    pub data: Option<String>,
    pub status: ConsumptionStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence contract for the idempotency ledger.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// `true` only when the record's status is `processed`; redelivered
    /// duplicates of an already-applied message should be acked and skipped.
    async fn is_processed(&self, message_id: &str) -> IdempotencyStoreResult<bool>;

    /// Insert-or-update into `processing`. The only write that can create a
    /// row. A no-op if the existing row is already `processed` (never
    /// downgrades a terminal record back to `processing`).
    async fn mark_processing(
        &self,
        message_id: &str,
        topic: Option<&str>,
        data: Option<&str>,
    ) -> IdempotencyStoreResult<()>;

    /// Transition to `processed`. Idempotent: `false` if no matching row exists.
    async fn mark_processed(&self, message_id: &str) -> IdempotencyStoreResult<bool>;

    /// Transition to `failed` with an error message. Idempotent.
    async fn mark_failed(&self, message_id: &str, error_text: &str) -> IdempotencyStoreResult<bool>;

    /// Transition from `failed` to `compensated`. Idempotent.
    async fn mark_compensated(&self, message_id: &str) -> IdempotencyStoreResult<bool>;

    /// Up to `limit` failed records, oldest `updated_at` first.
    async fn fetch_failed(&self, limit: i64) -> IdempotencyStoreResult<Vec<ConsumptionRecord>>;

    /// Create the `mq_consumption_records` table if it doesn't already exist.
    async fn create_schema(&self) -> IdempotencyStoreResult<()>;
}

/// SQLx/PostgreSQL implementation of [`IdempotencyStore`].
pub struct SqlxIdempotencyStore {
    pool: PgPool,
}

impl SqlxIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for SqlxIdempotencyStore {
    async fn is_processed(&self, message_id: &str) -> IdempotencyStoreResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM mq_consumption_records
                WHERE message_id = $1 AND status = 'processed'
            ) AS exists
            "#,
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("exists")?)
    }

    async fn mark_processing(
        &self,
        message_id: &str,
        topic: Option<&str>,
        data: Option<&str>,
    ) -> IdempotencyStoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO mq_consumption_records (message_id, topic, data, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'processing', NOW(), NOW())
            ON CONFLICT (message_id) DO UPDATE SET
                status = 'processing',
                topic = COALESCE(EXCLUDED.topic, mq_consumption_records.topic),
                data = COALESCE(EXCLUDED.data, mq_consumption_records.data),
                updated_at = NOW()
            WHERE mq_consumption_records.status <> 'processed'
            "#,
        )
        .bind(message_id)
        .bind(topic)
        .bind(data)
        .execute(&self.pool)
        .await?;

        debug!(message_id = %message_id, "idempotency store: marked processing");
        Ok(())
    }

    async fn mark_processed(&self, message_id: &str) -> IdempotencyStoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mq_consumption_records
            SET status = 'processed', updated_at = NOW()
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, message_id: &str, error_text: &str) -> IdempotencyStoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mq_consumption_records
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

    async fn mark_compensated(&self, message_id: &str) -> IdempotencyStoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mq_consumption_records
            SET status = 'compensated', updated_at = NOW()
            WHERE message_id = $1 AND status = 'failed'
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fetch_failed(&self, limit: i64) -> IdempotencyStoreResult<Vec<ConsumptionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, topic, data, status, error, created_at, updated_at
            FROM mq_consumption_records
            WHERE status = 'failed'
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status_str: String = row.try_get("status")?;
                Ok(ConsumptionRecord {
                    message_id: row.try_get("message_id")?,
                    topic: row.try_get("topic")?,
                    data: row.try_get("data")?,
                    status: ConsumptionStatus::parse(&status_str)?,
                    error: row.try_get("error")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn create_schema(&self) -> IdempotencyStoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mq_consumption_records (
                id BIGSERIAL PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                topic TEXT,
                data TEXT,
                status TEXT NOT NULL DEFAULT 'processing',
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mq_consumption_status ON mq_consumption_records (status, updated_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_string_form() {
        for status in [
            ConsumptionStatus::Processing,
            ConsumptionStatus::Processed,
            ConsumptionStatus::Failed,
            ConsumptionStatus::Compensated,
        ] {
            assert_eq!(ConsumptionStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!(ConsumptionStatus::parse("nonsense").is_err());
    }
}
