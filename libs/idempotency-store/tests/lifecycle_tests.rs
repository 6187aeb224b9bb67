//! Exercises the insert-or-update semantics of `mark_processing` and the
//! processing -> processed/failed -> compensated lifecycle against an
//! in-memory fake, independent of a live PostgreSQL instance.

use async_trait::async_trait;
use chrono::Utc;
use idempotency_store::{ConsumptionRecord, ConsumptionStatus, IdempotencyStore, IdempotencyStoreResult};
use std::collections::HashMap;
use std::sync::Mutex;

struct FakeIdempotencyStore {
    records: Mutex<HashMap<String, ConsumptionRecord>>,
}

impl FakeIdempotencyStore {
    fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl IdempotencyStore for FakeIdempotencyStore {
    async fn is_processed(&self, message_id: &str) -> IdempotencyStoreResult<bool> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(message_id)
            .map(|r| r.status == ConsumptionStatus::Processed)
            .unwrap_or(false))
    }

    async fn mark_processing(
        &self,
        message_id: &str,
        topic: Option<&str>,
        data: Option<&str>,
    ) -> IdempotencyStoreResult<()> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(message_id) {
            Some(r) if r.status == ConsumptionStatus::Processed => {}
            Some(r) => {
                r.status = ConsumptionStatus::Processing;
                if topic.is_some() {
                    r.topic = topic.map(str::to_string);
                }
                if data.is_some() {
                    r.data = data.map(str::to_string);
                }
                r.updated_at = Utc::now();
            }
            None => {
                records.insert(
                    message_id.to_string(),
                    ConsumptionRecord {
                        message_id: message_id.to_string(),
                        topic: topic.map(str::to_string),
                        data: data.map(str::to_string),
                        status: ConsumptionStatus::Processing,
                        error: None,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn mark_processed(&self, message_id: &str) -> IdempotencyStoreResult<bool> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(message_id) {
            Some(r) => {
                r.status = ConsumptionStatus::Processed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(&self, message_id: &str, error_text: &str) -> IdempotencyStoreResult<bool> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(message_id) {
            Some(r) => {
                r.status = ConsumptionStatus::Failed;
                r.error = Some(error_text.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_compensated(&self, message_id: &str) -> IdempotencyStoreResult<bool> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(message_id) {
            Some(r) if r.status == ConsumptionStatus::Failed => {
                r.status = ConsumptionStatus::Compensated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fetch_failed(&self, limit: i64) -> IdempotencyStoreResult<Vec<ConsumptionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == ConsumptionStatus::Failed)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn create_schema(&self) -> IdempotencyStoreResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn a_fresh_message_id_is_not_processed() {
    let store = FakeIdempotencyStore::new();
    assert_eq!(store.is_processed("m1").await.unwrap(), false);
}

#[tokio::test]
async fn mark_processing_creates_a_row_and_is_processed_stays_false() {
    let store = FakeIdempotencyStore::new();
    store
        .mark_processing("m1", Some("user.created"), Some("{}"))
        .await
        .unwrap();
    assert_eq!(store.is_processed("m1").await.unwrap(), false);
}

#[tokio::test]
async fn full_success_path_transitions_processing_to_processed() {
    let store = FakeIdempotencyStore::new();
    store.mark_processing("m1", None, None).await.unwrap();
    assert!(store.mark_processed("m1").await.unwrap());
    assert!(store.is_processed("m1").await.unwrap());
}

#[tokio::test]
async fn mark_processing_never_downgrades_an_already_processed_record() {
    let store = FakeIdempotencyStore::new();
    store.mark_processing("m1", None, None).await.unwrap();
    store.mark_processed("m1").await.unwrap();

    // A redelivery arrives after the message was already applied.
    store.mark_processing("m1", None, None).await.unwrap();
    assert!(store.is_processed("m1").await.unwrap());
}

#[tokio::test]
async fn failure_then_compensation_lifecycle() {
    let store = FakeIdempotencyStore::new();
    store.mark_processing("m1", None, None).await.unwrap();
    store.mark_failed("m1", "handler panicked").await.unwrap();

    let failed = store.fetch_failed(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_deref(), Some("handler panicked"));

    assert!(store.mark_compensated("m1").await.unwrap());
    assert_eq!(store.fetch_failed(10).await.unwrap().len(), 0);
    assert_eq!(store.is_processed("m1").await.unwrap(), false);
}

#[tokio::test]
async fn mark_operations_are_idempotent_on_absent_rows() {
    let store = FakeIdempotencyStore::new();
    assert_eq!(store.mark_processed("missing").await.unwrap(), false);
    assert_eq!(store.mark_failed("missing", "err").await.unwrap(), false);
    assert_eq!(store.mark_compensated("missing").await.unwrap(), false);
}

#[tokio::test]
async fn compensation_only_applies_to_failed_records() {
    let store = FakeIdempotencyStore::new();
    store.mark_processing("m1", None, None).await.unwrap();
    // Still `processing`, never failed — compensation should refuse.
    assert_eq!(store.mark_compensated("m1").await.unwrap(), false);
}
