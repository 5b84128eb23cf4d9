//! Shared fixtures: an in-memory broker consumer that records every
//! finalization, a recording metrics sink, and small helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_broker::{BrokerConsumer, BrokerError, PollBatch};
use relay_core::{BrokerHandle, MediationType, MessagePointer, PolledMessage};
use relay_router::PoolMetrics;

pub fn make_pointer(
    id: &str,
    pool_code: &str,
    group: Option<&str>,
    batch: Option<&str>,
) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: pool_code.to_string(),
        auth_token: None,
        mediation_type: MediationType::Http,
        mediation_target: "http://localhost:9999/handle".to_string(),
        message_group_id: group.map(|g| g.to_string()),
        batch_id: batch.map(|b| b.to_string()),
    }
}

pub fn make_polled(pointer: MessagePointer, queue: &str) -> PolledMessage {
    let handle = BrokerHandle::new(format!("receipt-{}", pointer.id));
    PolledMessage {
        pointer,
        handle,
        queue: queue.to_string(),
    }
}

/// In-memory consumer: deliveries are seeded by tests, finalizations are
/// recorded for assertions.
pub struct FakeConsumer {
    identifier: String,
    pending: Mutex<VecDeque<PolledMessage>>,
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<(String, Option<u32>)>>,
    fast_failed: Mutex<Vec<String>>,
    running: AtomicBool,
}

impl FakeConsumer {
    pub fn new(identifier: &str) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.to_string(),
            pending: Mutex::new(VecDeque::new()),
            acked: Mutex::new(Vec::new()),
            nacked: Mutex::new(Vec::new()),
            fast_failed: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        })
    }

    pub fn seed(&self, msg: PolledMessage) {
        self.pending.lock().push_back(msg);
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().clone()
    }

    pub fn nacked(&self) -> Vec<(String, Option<u32>)> {
        self.nacked.lock().clone()
    }

    pub fn fast_failed(&self) -> Vec<String> {
        self.fast_failed.lock().clone()
    }

    pub fn finalized_count(&self) -> usize {
        self.acked.lock().len() + self.nacked.lock().len() + self.fast_failed.lock().len()
    }
}

#[async_trait]
impl BrokerConsumer for FakeConsumer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn poll(&self, max_messages: u32) -> relay_broker::Result<PollBatch> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }

        let mut pending = self.pending.lock();
        let take = std::cmp::min(max_messages as usize, pending.len());
        let messages: Vec<PolledMessage> = pending.drain(0..take).collect();
        Ok(PollBatch {
            messages,
            malformed: 0,
        })
    }

    async fn ack(&self, handle: &BrokerHandle) -> relay_broker::Result<()> {
        self.acked.lock().push(handle.as_str().to_string());
        Ok(())
    }

    async fn nack(
        &self,
        handle: &BrokerHandle,
        delay_seconds: Option<u32>,
    ) -> relay_broker::Result<()> {
        self.nacked
            .lock()
            .push((handle.as_str().to_string(), delay_seconds));
        Ok(())
    }

    async fn set_fast_fail_visibility(&self, handle: &BrokerHandle) -> relay_broker::Result<()> {
        self.fast_failed.lock().push(handle.as_str().to_string());
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Metrics sink that counts instead of exporting.
#[derive(Default)]
pub struct RecordingMetrics {
    pub submitted: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub rate_limited: AtomicU64,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn success_count(&self) -> u64 {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn rate_limited_count(&self) -> u64 {
        self.rate_limited.load(Ordering::SeqCst)
    }
}

impl PoolMetrics for RecordingMetrics {
    fn initialize_pool(&self, _: &str, _: u32, _: u32) {}

    fn message_submitted(&self, _: &str) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    fn processing_success(&self, _: &str, _: Duration) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn processing_failure(&self, _: &str, _: Duration, _: &str) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn rate_limit_exceeded(&self, _: &str) {
        self.rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    fn update_pool_gauges(&self, _: &str, _: u32, _: u32, _: u32, _: u32) {}
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
