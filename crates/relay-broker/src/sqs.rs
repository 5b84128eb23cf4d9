//! AWS SQS consumer.
//!
//! Ack deletes the message; nack and fast-fail are visibility changes.
//! For FIFO queues the `MessageGroupId` system attribute supplies the group
//! when the payload does not carry one.

use async_trait::async_trait;
use aws_sdk_sqs::types::{Message as SqsMessage, MessageSystemAttributeName};
use aws_sdk_sqs::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

use relay_core::{BrokerHandle, MessagePointer, PolledMessage};

use crate::{parse_pointer, BrokerConsumer, BrokerError, PollBatch, Result};

pub struct SqsConsumer {
    client: Client,
    queue_url: String,
    queue_name: String,
    visibility_timeout_seconds: i32,
    wait_time_seconds: i32,
    fast_fail_seconds: i32,
    running: AtomicBool,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
}

impl SqsConsumer {
    /// Long-poll wait. SQS caps this at 20 seconds.
    pub const DEFAULT_WAIT_TIME_SECONDS: i32 = 20;
    /// Visibility applied on rate-limit rejections so the broker redelivers
    /// almost immediately.
    pub const FAST_FAIL_SECONDS: i32 = 1;

    pub fn new(client: Client, queue_url: String, visibility_timeout_seconds: i32) -> Self {
        let queue_name = queue_url
            .rsplit('/')
            .next()
            .unwrap_or("unknown")
            .to_string();

        Self {
            client,
            queue_url,
            queue_name,
            visibility_timeout_seconds,
            wait_time_seconds: Self::DEFAULT_WAIT_TIME_SECONDS,
            fast_fail_seconds: Self::FAST_FAIL_SECONDS,
            running: AtomicBool::new(true),
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
            total_nacked: AtomicU64::new(0),
        }
    }

    /// Override the long-poll wait (clamped to the SQS range 0-20).
    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds.clamp(0, 20);
        self
    }

    fn parse_delivery(&self, sqs_msg: &SqsMessage) -> Result<PolledMessage> {
        let body = sqs_msg
            .body()
            .ok_or_else(|| BrokerError::Sqs("message body is empty".to_string()))?;

        let mut pointer: MessagePointer = parse_pointer(body)?;

        // FIFO queues carry the group as a system attribute; the body wins
        // when both are present.
        if pointer.message_group_id.is_none() {
            pointer.message_group_id = sqs_msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::MessageGroupId))
                .map(|g| g.to_string());
        }

        let receipt_handle = sqs_msg
            .receipt_handle()
            .ok_or_else(|| BrokerError::Sqs("missing receipt handle".to_string()))?;

        Ok(PolledMessage {
            pointer,
            handle: BrokerHandle::new(receipt_handle),
            queue: self.queue_name.clone(),
        })
    }

    async fn change_visibility(&self, handle: &BrokerHandle, seconds: i32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(handle.as_str())
            .visibility_timeout(seconds)
            .send()
            .await
            .map_err(|e| BrokerError::Sqs(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for SqsConsumer {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32) -> Result<PollBatch> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }

        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, 10) as i32)
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(self.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| BrokerError::Sqs(e.to_string()))?;

        let deliveries = result.messages.unwrap_or_default();
        let mut batch = PollBatch::default();

        for sqs_msg in &deliveries {
            match self.parse_delivery(sqs_msg) {
                Ok(msg) => batch.messages.push(msg),
                Err(e) => {
                    warn!(
                        queue = %self.queue_name,
                        error = %e,
                        "Malformed SQS delivery, nacking"
                    );
                    batch.malformed += 1;
                    if let Some(handle) = sqs_msg.receipt_handle() {
                        let _ = self
                            .change_visibility(&BrokerHandle::new(handle), 0)
                            .await;
                    }
                }
            }
        }

        if !batch.messages.is_empty() {
            self.total_polled
                .fetch_add(batch.messages.len() as u64, Ordering::Relaxed);
            debug!(
                queue = %self.queue_name,
                count = batch.messages.len(),
                "Polled messages from SQS"
            );
        }

        Ok(batch)
    }

    async fn ack(&self, handle: &BrokerHandle) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(handle.as_str())
            .send()
            .await
            .map_err(|e| BrokerError::Sqs(e.to_string()))?;

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, handle: &BrokerHandle, delay_seconds: Option<u32>) -> Result<()> {
        self.change_visibility(handle, delay_seconds.unwrap_or(0) as i32)
            .await?;
        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set_fast_fail_visibility(&self, handle: &BrokerHandle) -> Result<()> {
        self.change_visibility(handle, self.fast_fail_seconds).await
    }

    async fn reset_visibility(&self, handle: &BrokerHandle) -> Result<()> {
        self.change_visibility(handle, self.visibility_timeout_seconds)
            .await
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQS consumer stopped");
    }
}
