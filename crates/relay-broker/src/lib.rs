use async_trait::async_trait;
use relay_core::{BrokerHandle, MessagePointer, PolledMessage};

pub mod error;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "activemq")]
pub mod activemq;

pub use error::BrokerError;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Result of one poll: parsed messages plus the count of deliveries whose
/// payload could not be parsed (each already nacked by the consumer).
#[derive(Debug, Default)]
pub struct PollBatch {
    pub messages: Vec<PolledMessage>,
    pub malformed: u32,
}

impl PollBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.malformed == 0
    }
}

/// Contract every broker consumer satisfies. One instance per queue; the
/// router runs N poll loops against it and hands back the opaque handle for
/// every terminal call.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Unique identifier for this consumer, normally the queue name.
    fn identifier(&self) -> &str;

    /// Fetch up to `max_messages` deliveries, long-polling where the broker
    /// supports it. Malformed payloads are nacked internally and counted;
    /// they must never abort the batch.
    async fn poll(&self, max_messages: u32) -> Result<PollBatch>;

    /// Finalize a delivery (remove from the broker).
    async fn ack(&self, handle: &BrokerHandle) -> Result<()>;

    /// Return a delivery for redelivery after the given delay (broker
    /// semantics permitting).
    async fn nack(&self, handle: &BrokerHandle, delay_seconds: Option<u32>) -> Result<()>;

    /// Shorten visibility so a rate-limited delivery comes back quickly.
    /// Brokers without visibility control fall back to a short nack.
    async fn set_fast_fail_visibility(&self, handle: &BrokerHandle) -> Result<()> {
        self.nack(handle, Some(1)).await
    }

    /// Restore the default visibility after a real processing failure.
    /// No-op where the broker manages this itself.
    async fn reset_visibility(&self, _handle: &BrokerHandle) -> Result<()> {
        Ok(())
    }

    fn is_healthy(&self) -> bool;

    /// Stop accepting new polls; in-flight ack/nack calls still complete.
    async fn stop(&self);
}

/// Publishing side, implemented by the embedded queue for development and
/// tests.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    fn identifier(&self) -> &str;

    async fn publish(&self, pointer: MessagePointer) -> Result<String>;

    async fn publish_batch(&self, pointers: Vec<MessagePointer>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            ids.push(self.publish(pointer).await?);
        }
        Ok(ids)
    }
}

/// Parse a wire payload into a pointer. Shared by all consumer impls.
pub fn parse_pointer(body: &str) -> Result<MessagePointer> {
    Ok(serde_json::from_str(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_pointer("not json").is_err());
        assert!(parse_pointer(r#"{"id": "x"}"#).is_err());
    }

    #[test]
    fn parse_accepts_minimal_payload() {
        let pointer = parse_pointer(
            r#"{"id":"a","poolCode":"P","mediationType":"HTTP","mediationTarget":"http://t"}"#,
        )
        .unwrap();
        assert_eq!(pointer.id, "a");
    }
}
