//! Embedded SQLite-backed queue for development and tests.
//!
//! Approximates SQS FIFO semantics: visibility timeouts, receipt handles,
//! and strict ordering per message group (a group with an in-flight delivery
//! yields nothing until that delivery is acked or becomes visible again).
//! Ack commits (deletes the row); nack rolls back (restores visibility).

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use relay_core::{BrokerHandle, MessagePointer, PolledMessage};

use crate::{parse_pointer, BrokerConsumer, BrokerError, BrokerPublisher, PollBatch, Result};

pub struct EmbeddedQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
    running: AtomicBool,
}

impl EmbeddedQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: String, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            queue_name,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                message_group_id TEXT,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER DEFAULT 0,
                PRIMARY KEY (queue_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (queue_name, visible_at, message_group_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_receipt
            ON queue_messages (queue_name, receipt_handle)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "Embedded queue schema initialized");
        Ok(())
    }

    async fn set_visibility(&self, handle: &BrokerHandle, delay_seconds: i64) -> Result<()> {
        let visible_at = Utc::now().timestamp() + delay_seconds;
        sqlx::query(
            r#"
            UPDATE queue_messages SET visible_at = ?
            WHERE queue_name = ? AND receipt_handle = ?
            "#,
        )
        .bind(visible_at)
        .bind(&self.queue_name)
        .bind(handle.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for EmbeddedQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32) -> Result<PollBatch> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }

        let now = Utc::now().timestamp();
        let new_visible_at = now + self.visibility_timeout_seconds as i64;

        // Take at most one message per group, and skip groups that still
        // have an invisible (in-flight) delivery to preserve FIFO.
        let rows = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT id, payload,
                       ROW_NUMBER() OVER (
                           PARTITION BY COALESCE(message_group_id, id)
                           ORDER BY created_at, id
                       ) AS rn
                FROM queue_messages q
                WHERE queue_name = ?1 AND visible_at <= ?2
                  AND NOT EXISTS (
                      SELECT 1 FROM queue_messages b
                      WHERE b.queue_name = q.queue_name
                        AND b.message_group_id IS NOT NULL
                        AND b.message_group_id = q.message_group_id
                        AND b.visible_at > ?2
                  )
            )
            SELECT id, payload FROM eligible WHERE rn = 1 LIMIT ?3
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut batch = PollBatch::default();

        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("payload");

            let receipt_handle = uuid::Uuid::new_v4().to_string();

            let updated = sqlx::query(
                r#"
                UPDATE queue_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE id = ? AND queue_name = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(&id)
            .bind(&self.queue_name)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                // another consumer claimed it between select and update
                continue;
            }

            match parse_pointer(&payload) {
                Ok(pointer) => batch.messages.push(PolledMessage {
                    pointer,
                    handle: BrokerHandle::new(receipt_handle),
                    queue: self.queue_name.clone(),
                }),
                Err(e) => {
                    warn!(
                        queue = %self.queue_name,
                        message_id = %id,
                        error = %e,
                        "Malformed embedded delivery, nacking"
                    );
                    batch.malformed += 1;
                    let _ = self
                        .set_visibility(&BrokerHandle::new(receipt_handle), 0)
                        .await;
                }
            }
        }

        if !batch.messages.is_empty() {
            debug!(
                queue = %self.queue_name,
                count = batch.messages.len(),
                "Polled messages from embedded queue"
            );
        }

        Ok(batch)
    }

    async fn ack(&self, handle: &BrokerHandle) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM queue_messages WHERE queue_name = ? AND receipt_handle = ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(handle.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn nack(&self, handle: &BrokerHandle, delay_seconds: Option<u32>) -> Result<()> {
        self.set_visibility(handle, delay_seconds.unwrap_or(0) as i64)
            .await
    }

    async fn set_fast_fail_visibility(&self, handle: &BrokerHandle) -> Result<()> {
        self.set_visibility(handle, 1).await
    }

    async fn reset_visibility(&self, handle: &BrokerHandle) -> Result<()> {
        self.set_visibility(handle, self.visibility_timeout_seconds as i64)
            .await
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "Embedded queue consumer stopped");
    }
}

#[async_trait]
impl BrokerPublisher for EmbeddedQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, pointer: MessagePointer) -> Result<String> {
        let id = pointer.id.clone();
        let payload = serde_json::to_string(&pointer)?;
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, queue_name, message_group_id, visible_at, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&self.queue_name)
        .bind(&pointer.message_group_id)
        .bind(now)
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::MediationType;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_queue() -> EmbeddedQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = EmbeddedQueue::new(pool, "test-queue".to_string(), 30);
        queue.init_schema().await.unwrap();
        queue
    }

    fn pointer(id: &str, group: Option<&str>) -> MessagePointer {
        MessagePointer {
            id: id.to_string(),
            pool_code: "P".to_string(),
            auth_token: None,
            mediation_type: MediationType::Http,
            mediation_target: "http://localhost:9000/handle".to_string(),
            message_group_id: group.map(|g| g.to_string()),
            batch_id: None,
        }
    }

    #[tokio::test]
    async fn publish_poll_ack_round_trip() {
        let queue = test_queue().await;

        queue.publish(pointer("a", None)).await.unwrap();
        let batch = queue.poll(10).await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].pointer.id, "a");

        queue.ack(&batch.messages[0].handle).await.unwrap();

        // gone for good
        let batch = queue.poll(10).await.unwrap();
        assert!(batch.messages.is_empty());
    }

    #[tokio::test]
    async fn nack_makes_message_visible_again() {
        let queue = test_queue().await;

        queue.publish(pointer("a", None)).await.unwrap();
        let batch = queue.poll(10).await.unwrap();
        assert_eq!(batch.messages.len(), 1);

        // invisible while in flight
        assert!(queue.poll(10).await.unwrap().messages.is_empty());

        queue.nack(&batch.messages[0].handle, None).await.unwrap();
        let batch = queue.poll(10).await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].pointer.id, "a");
    }

    #[tokio::test]
    async fn group_blocks_until_head_is_acked() {
        let queue = test_queue().await;

        queue.publish(pointer("a1", Some("g"))).await.unwrap();
        queue.publish(pointer("a2", Some("g"))).await.unwrap();

        let batch = queue.poll(10).await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].pointer.id, "a1");

        // a2 must not surface while a1 is in flight
        assert!(queue.poll(10).await.unwrap().messages.is_empty());

        queue.ack(&batch.messages[0].handle).await.unwrap();
        let batch = queue.poll(10).await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].pointer.id, "a2");
    }

    #[tokio::test]
    async fn malformed_payload_is_counted_not_fatal() {
        let queue = test_queue().await;
        let now = Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO queue_messages (id, queue_name, visible_at, payload, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind("bad")
        .bind("test-queue")
        .bind(now)
        .bind("{ not json")
        .bind(now)
        .execute(&queue.pool)
        .await
        .unwrap();

        queue.publish(pointer("good", None)).await.unwrap();

        let batch = queue.poll(10).await.unwrap();
        assert_eq!(batch.malformed, 1);
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].pointer.id, "good");
    }
}
