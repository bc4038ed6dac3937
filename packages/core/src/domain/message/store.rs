//! Durable storage and status transitions for message records.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::common::{AppError, MessageId};

use super::model::{MessageRecord, MessageStatus};

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, record: MessageRecord) -> Result<MessageRecord>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<MessageRecord>>;

    /// Rows whose `scheduled_send_at` falls in `[lo, hi)`, for the minute enqueuer.
    async fn find_scheduled_between(
        &self,
        lo: DateTime<Utc>,
        hi: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>>;

    /// Non-terminal rows stuck past `now - grace`, for the recovery sweeper.
    async fn find_missed(&self, now: DateTime<Utc>, grace: chrono::Duration) -> Result<Vec<MessageRecord>>;

    /// Whether a non-terminal row already exists for this idempotency key.
    async fn check_idempotency(&self, key: &str) -> Result<bool>;

    /// Compare-and-set the status. Returns `Ok(true)` only if the row was in
    /// `from` and is now `to`; a mismatch (already moved by another worker)
    /// returns `Ok(false)` without error. `reason`, when given, is recorded
    /// as `last_error` so terminal transitions outside the normal send path
    /// (e.g. a reschedule) leave an audit trail.
    async fn transition_status(
        &self,
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
        reason: Option<&str>,
    ) -> Result<bool>;

    async fn mark_sent(&self, id: MessageId, vendor_status: i32) -> Result<bool>;

    /// Marks FAILED-retry or FAILED-terminal depending on `max_retries`,
    /// incrementing `retry_count`. Returns the status actually applied.
    async fn mark_failed(&self, id: MessageId, error: &str, max_retries: i32) -> Result<MessageStatus>;

    /// All non-terminal records for a user, for RescheduleService.
    async fn find_pending_for_user(&self, user_id: crate::common::UserId) -> Result<Vec<MessageRecord>>;
}

pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn create(&self, record: MessageRecord) -> Result<MessageRecord> {
        let result = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO message_records (
                id, user_id, message_type, body, scheduled_send_at, actual_send_at,
                status, retry_count, idempotency_key, last_vendor_status, last_error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id, user_id, message_type, body, scheduled_send_at, actual_send_at,
                      status, retry_count, idempotency_key, last_vendor_status, last_error,
                      created_at, updated_at
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.message_type)
        .bind(&record.body)
        .bind(record.scheduled_send_at)
        .bind(record.actual_send_at)
        .bind(record.status)
        .bind(record.retry_count)
        .bind(&record.idempotency_key)
        .bind(record.last_vendor_status)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(inserted) => Ok(inserted),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(AppError::Conflict(format!(
                    "idempotency key {} already has an active message",
                    record.idempotency_key
                ))
                .into())
            }
            Err(e) => Err(AppError::Database(e).into()),
        }
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        let record = sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM message_records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_scheduled_between(
        &self,
        lo: DateTime<Utc>,
        hi: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT * FROM message_records
            WHERE status = 'scheduled'
              AND scheduled_send_at >= $1
              AND scheduled_send_at < $2
            ORDER BY scheduled_send_at ASC
            "#,
        )
        .bind(lo)
        .bind(hi)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_missed(&self, now: DateTime<Utc>, grace: chrono::Duration) -> Result<Vec<MessageRecord>> {
        let cutoff = now - grace;
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT * FROM message_records
            WHERE status IN ('scheduled', 'queued', 'sending', 'failed_retry')
              AND scheduled_send_at < $1
            ORDER BY scheduled_send_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn check_idempotency(&self, key: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM message_records
                WHERE idempotency_key = $1
                  AND status NOT IN ('sent', 'failed_terminal')
            )
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn transition_status(
        &self,
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message_records
            SET status = $1,
                last_error = COALESCE($2, last_error),
                updated_at = NOW()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(to)
        .bind(reason)
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_sent(&self, id: MessageId, vendor_status: i32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message_records
            SET status = 'sent',
                actual_send_at = NOW(),
                last_vendor_status = $1,
                updated_at = NOW()
            WHERE id = $2 AND status = 'sending'
            "#,
        )
        .bind(vendor_status)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: MessageId, error: &str, max_retries: i32) -> Result<MessageStatus> {
        let row = sqlx::query_as::<_, (i32,)>(
            "SELECT retry_count FROM message_records WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        let new_retry_count = row.0 + 1;
        let next_status = if new_retry_count >= max_retries {
            MessageStatus::FailedTerminal
        } else {
            MessageStatus::FailedRetry
        };

        sqlx::query(
            r#"
            UPDATE message_records
            SET status = $1,
                retry_count = $2,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(next_status)
        .bind(new_retry_count)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(next_status)
    }

    async fn find_pending_for_user(&self, user_id: crate::common::UserId) -> Result<Vec<MessageRecord>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT * FROM message_records
            WHERE user_id = $1
              AND status NOT IN ('sent', 'failed_terminal')
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

/// In-memory double for unit tests that exercise the scheduling loops and
/// worker pool without a database.
#[derive(Default)]
pub struct InMemoryMessageStore {
    records: RwLock<HashMap<MessageId, MessageRecord>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<MessageRecord> {
        self.records.read().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(&self, record: MessageRecord) -> Result<MessageRecord> {
        self.records.write().unwrap().insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        Ok(self.records.read().unwrap().get(&id).cloned())
    }

    async fn find_scheduled_between(
        &self,
        lo: DateTime<Utc>,
        hi: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| r.status == MessageStatus::Scheduled && r.scheduled_send_at >= lo && r.scheduled_send_at < hi)
            .cloned()
            .collect())
    }

    async fn find_missed(&self, now: DateTime<Utc>, grace: chrono::Duration) -> Result<Vec<MessageRecord>> {
        let cutoff = now - grace;
        Ok(self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| !r.status.is_terminal() && r.scheduled_send_at < cutoff)
            .cloned()
            .collect())
    }

    async fn check_idempotency(&self, key: &str) -> Result<bool> {
        Ok(self
            .records
            .read()
            .unwrap()
            .values()
            .any(|r| r.idempotency_key == key && !r.status.is_terminal()))
    }

    async fn transition_status(
        &self,
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(&id) {
            if record.status == from {
                record.status = to;
                if let Some(reason) = reason {
                    record.last_error = Some(reason.to_string());
                }
                record.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_sent(&self, id: MessageId, vendor_status: i32) -> Result<bool> {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(&id) {
            if record.status == MessageStatus::Sending {
                record.status = MessageStatus::Sent;
                record.actual_send_at = Some(Utc::now());
                record.last_vendor_status = Some(vendor_status);
                record.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_failed(&self, id: MessageId, error: &str, max_retries: i32) -> Result<MessageStatus> {
        let mut records = self.records.write().unwrap();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("unknown message id {id}"))?;

        record.retry_count += 1;
        record.status = if record.retry_count >= max_retries {
            MessageStatus::FailedTerminal
        } else {
            MessageStatus::FailedRetry
        };
        record.last_error = Some(error.to_string());
        record.updated_at = Utc::now();

        Ok(record.status)
    }

    async fn find_pending_for_user(&self, user_id: crate::common::UserId) -> Result<Vec<MessageRecord>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| r.user_id == user_id && !r.status.is_terminal())
            .cloned()
            .collect())
    }
}
