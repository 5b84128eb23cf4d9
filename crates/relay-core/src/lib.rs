use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub mod logging;

/// Reserved group for pointers that carry no `messageGroupId`.
pub const DEFAULT_GROUP: &str = "__DEFAULT__";

// ============================================================================
// Message pointer
// ============================================================================

/// The unit of work: a small envelope describing where the real payload lives
/// and how to deliver it. The router never inspects the payload itself.
///
/// Wire format is camelCase JSON; unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    pub id: String,
    pub pool_code: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub mediation_type: MediationType,
    pub mediation_target: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl MessagePointer {
    /// Group id for FIFO partitioning, with the reserved default fallback.
    /// An empty string counts as absent.
    pub fn group_id(&self) -> &str {
        self.message_group_id
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(DEFAULT_GROUP)
    }
}

/// Delivery strategy selector. The variant set is open; HTTP is the only
/// strategy the core ships.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediationType {
    #[serde(rename = "HTTP")]
    Http,
}

/// Opaque broker receipt. Minted by the originating consumer, interpreted
/// only by it; the router just hands it back for ack/nack/visibility calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerHandle(String);

impl BrokerHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pointer pulled off a broker, paired with its handle and source queue.
#[derive(Debug, Clone)]
pub struct PolledMessage {
    pub pointer: MessagePointer,
    pub handle: BrokerHandle,
    pub queue: String,
}

// ============================================================================
// Routing & disposition
// ============================================================================

/// Outcome of routing a single polled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Accepted into a pool; exactly one terminal ack/nack will follow.
    Accepted,
    /// Another copy of the same id is already in flight; the duplicate was
    /// nacked back to its broker.
    DuplicateSuppressed,
    /// Unknown pool or group queue full; nacked for redelivery.
    Rejected,
}

/// Terminal verdict a pool reports for an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack { delay_seconds: Option<u32> },
    /// Rate-limit rejection: shorten visibility so the broker redelivers
    /// as quickly as it can.
    FastRetry,
}

// ============================================================================
// In-flight tracking
// ============================================================================

/// Dedup-map entry, alive from route acceptance to the terminal disposition.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub message_id: String,
    pub pool_code: String,
    pub group_id: Option<String>,
    pub batch_id: Option<String>,
    pub queue: String,
    pub accepted_at: Instant,
}

impl InFlightEntry {
    pub fn new(pointer: &MessagePointer, batch_id: Option<String>, queue: String) -> Self {
        Self {
            message_id: pointer.id.clone(),
            pool_code: pointer.pool_code.clone(),
            group_id: pointer.message_group_id.clone(),
            batch_id,
            queue,
            accepted_at: Instant::now(),
        }
    }

    pub fn age_seconds(&self) -> u64 {
        self.accepted_at.elapsed().as_secs()
    }
}

// ============================================================================
// Topology (control-plane configuration)
// ============================================================================

/// Runtime parameters for one processing pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub code: String,
    pub concurrency: u32,
    pub rate_limit_per_minute: Option<u32>,
}

impl PoolSpec {
    /// Bounded capacity of each group queue inside the pool.
    pub fn queue_capacity_per_group(&self) -> u32 {
        std::cmp::max(self.concurrency.saturating_mul(10), 500)
    }
}

/// One broker-native queue the router should consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    /// Overrides the broker endpoint for this queue when present.
    pub uri: Option<String>,
}

/// The full control-plane view: queues to consume, consumer loops per queue,
/// and the pool set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub queues: Vec<QueueSpec>,
    pub connections: u32,
    pub pools: Vec<PoolSpec>,
}

// ============================================================================
// Mediation
// ============================================================================

/// Classification of one delivery attempt chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationResult {
    /// Delivered and accepted downstream.
    Success,
    /// Permanent endpoint misconfiguration; ack so the broker stops
    /// redelivering, operators get a critical warning.
    ErrorConfig,
    /// Retryable processing failure downstream.
    ErrorProcess,
    /// Retryable, expected-transient server condition (429/502/503).
    ErrorServer,
    /// Network, DNS, TLS, or timeout failure before a response arrived.
    ErrorConnection,
}

impl MediationResult {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MediationResult::ErrorProcess
                | MediationResult::ErrorServer
                | MediationResult::ErrorConnection
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediationResult::Success => "SUCCESS",
            MediationResult::ErrorConfig => "ERROR_CONFIG",
            MediationResult::ErrorProcess => "ERROR_PROCESS",
            MediationResult::ErrorServer => "ERROR_SERVER",
            MediationResult::ErrorConnection => "ERROR_CONNECTION",
        }
    }
}

/// Result of mediating one message, with enough context for redelivery
/// pacing and diagnostics.
#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub status_code: Option<u16>,
    /// Redelivery delay hint, e.g. from a Retry-After header.
    pub retry_delay_seconds: Option<u32>,
    pub detail: Option<String>,
}

impl MediationOutcome {
    pub fn success(status_code: u16) -> Self {
        Self {
            result: MediationResult::Success,
            status_code: Some(status_code),
            retry_delay_seconds: None,
            detail: None,
        }
    }

    pub fn error_config(status_code: u16, detail: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorConfig,
            status_code: Some(status_code),
            retry_delay_seconds: None,
            detail: Some(detail.into()),
        }
    }

    pub fn error_process(status_code: Option<u16>, detail: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            status_code,
            retry_delay_seconds: Some(30),
            detail: Some(detail.into()),
        }
    }

    pub fn error_server(
        status_code: Option<u16>,
        retry_delay_seconds: Option<u32>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            result: MediationResult::ErrorServer,
            status_code,
            retry_delay_seconds,
            detail: Some(detail.into()),
        }
    }

    pub fn error_connection(detail: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorConnection,
            status_code: None,
            retry_delay_seconds: Some(5),
            detail: Some(detail.into()),
        }
    }
}

// ============================================================================
// Warnings
// ============================================================================

/// Operational warning categories emitted by the router core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningKind {
    Mediation,
    Configuration,
    Processing,
    Leak,
    UnknownPool,
    PoolLimitExceeded,
    MediatorNullResult,
    ParseError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub kind: WarningKind,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        kind: WarningKind,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

// ============================================================================
// Pool snapshot (monitoring)
// ============================================================================

/// Point-in-time view of one pool, for gauges and the stats surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub pool_code: String,
    pub concurrency: u32,
    pub active: u32,
    pub available_permits: u32,
    pub queue_size: u32,
    pub group_count: u32,
    pub queue_capacity_per_group: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub draining: bool,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("mediation error: {0}")]
    Mediation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_parses_wire_payload() {
        let body = r#"{
            "id": "m-1",
            "poolCode": "P",
            "authToken": "tok",
            "mediationType": "HTTP",
            "mediationTarget": "http://localhost:9000/handle",
            "messageGroupId": "g1",
            "batchId": null,
            "someFutureField": 42
        }"#;

        let pointer: MessagePointer = serde_json::from_str(body).unwrap();
        assert_eq!(pointer.id, "m-1");
        assert_eq!(pointer.pool_code, "P");
        assert_eq!(pointer.mediation_type, MediationType::Http);
        assert_eq!(pointer.group_id(), "g1");
        assert!(pointer.batch_id.is_none());
    }

    #[test]
    fn missing_group_maps_to_default() {
        let body = r#"{
            "id": "m-2",
            "poolCode": "P",
            "mediationType": "HTTP",
            "mediationTarget": "http://localhost:9000/handle"
        }"#;

        let pointer: MessagePointer = serde_json::from_str(body).unwrap();
        assert_eq!(pointer.group_id(), DEFAULT_GROUP);
        assert!(pointer.auth_token.is_none());
    }

    #[test]
    fn empty_group_maps_to_default() {
        let pointer = MessagePointer {
            id: "m-3".to_string(),
            pool_code: "P".to_string(),
            auth_token: None,
            mediation_type: MediationType::Http,
            mediation_target: "http://localhost:9000".to_string(),
            message_group_id: Some(String::new()),
            batch_id: None,
        };
        assert_eq!(pointer.group_id(), DEFAULT_GROUP);
    }

    #[test]
    fn group_queue_capacity_has_floor() {
        let small = PoolSpec {
            code: "S".to_string(),
            concurrency: 2,
            rate_limit_per_minute: None,
        };
        assert_eq!(small.queue_capacity_per_group(), 500);

        let large = PoolSpec {
            code: "L".to_string(),
            concurrency: 100,
            rate_limit_per_minute: None,
        };
        assert_eq!(large.queue_capacity_per_group(), 1000);
    }

    #[test]
    fn retryable_results() {
        assert!(MediationResult::ErrorProcess.is_retryable());
        assert!(MediationResult::ErrorServer.is_retryable());
        assert!(MediationResult::ErrorConnection.is_retryable());
        assert!(!MediationResult::Success.is_retryable());
        assert!(!MediationResult::ErrorConfig.is_retryable());
    }
}
