//! HTTP delivery of message pointers.
//!
//! The mediator POSTs `{"messageId": "<id>"}` to the pointer's target; the
//! downstream is expected to fetch the full message by id elsewhere. The
//! call is wrapped in explicit resilience: a per-origin circuit breaker, a
//! bounded retry with jitter, and a per-attempt timeout.

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use relay_core::{
    MediationOutcome, MediationResult, MediationType, MessagePointer, WarningKind,
    WarningSeverity,
};

use crate::breaker::{BreakerConfig, BreakerRegistry, BreakerStats};
use crate::warning::WarningService;

/// Strategy interface for delivering a pointer downstream.
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn process(&self, pointer: &MessagePointer) -> MediationOutcome;
}

#[derive(Debug, Serialize)]
struct MediationPayload<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    /// HTTP/1.1 only; easier to debug locally.
    Http1,
    /// ALPN-negotiated HTTP/2 where the server offers it.
    #[default]
    Http2,
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    /// Per-attempt timeout. Expiry classifies as ERROR_CONNECTION.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub http_version: HttpVersion,
    /// Total attempts for retryable results, including the first.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    /// Upper bound of the random jitter added to each retry delay.
    pub retry_jitter: Duration,
    pub breaker: BreakerConfig,
    /// The 4xx/5xx boundary knob: when set, 422 classifies as ERROR_SERVER
    /// instead of ERROR_PROCESS.
    pub treat_422_as_server: bool,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(900),
            connect_timeout: Duration::from_secs(30),
            http_version: HttpVersion::Http2,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_jitter: Duration::from_millis(500),
            breaker: BreakerConfig::default(),
            treat_422_as_server: false,
        }
    }
}

impl HttpMediatorConfig {
    /// Development profile: HTTP/1.1 and a short timeout.
    pub fn dev() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            http_version: HttpVersion::Http1,
            ..Default::default()
        }
    }
}

/// Classify a downstream status code.
///
/// 200/201 succeed; 400/404/409 are permanent endpoint misconfiguration;
/// 429/502/503 are expected-transient server conditions; 422 and remaining
/// 5xx are retryable processing failures; anything else is treated as a
/// server error.
fn classify_status(status: u16, treat_422_as_server: bool) -> MediationResult {
    match status {
        200 | 201 => MediationResult::Success,
        400 | 404 | 409 => MediationResult::ErrorConfig,
        429 | 502 | 503 => MediationResult::ErrorServer,
        422 => {
            if treat_422_as_server {
                MediationResult::ErrorServer
            } else {
                MediationResult::ErrorProcess
            }
        }
        500..=599 => MediationResult::ErrorProcess,
        _ => MediationResult::ErrorServer,
    }
}

pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
    breakers: BreakerRegistry,
    warnings: Option<Arc<WarningService>>,
}

impl HttpMediator {
    pub fn new(config: HttpMediatorConfig) -> crate::Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10);

        if config.http_version == HttpVersion::Http1 {
            builder = builder.http1_only();
        }

        let client = builder.build()?;
        let breakers = BreakerRegistry::new(config.breaker.clone());

        info!(
            timeout_secs = config.request_timeout.as_secs(),
            http_version = ?config.http_version,
            max_attempts = config.max_attempts,
            "HTTP mediator initialized"
        );

        Ok(Self {
            client,
            config,
            breakers,
            warnings: None,
        })
    }

    pub fn with_warning_service(mut self, warnings: Arc<WarningService>) -> Self {
        self.warnings = Some(warnings);
        self
    }

    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.breakers.stats()
    }

    fn warn_misconfigured(&self, pointer: &MessagePointer, status: u16) {
        if let Some(ref warnings) = self.warnings {
            warnings.add_warning(
                WarningKind::Configuration,
                WarningSeverity::Critical,
                format!(
                    "HTTP {status} from [{}] for message [{}] - endpoint misconfigured, message acked",
                    pointer.mediation_target, pointer.id
                ),
                "HttpMediator".to_string(),
            );
        }
    }

    async fn attempt(&self, pointer: &MessagePointer) -> MediationOutcome {
        let breaker = self.breakers.for_target(&pointer.mediation_target);

        if !breaker.allow_request() {
            debug!(
                message_id = %pointer.id,
                target = %pointer.mediation_target,
                "Circuit open, skipping request"
            );
            return MediationOutcome::error_connection("circuit breaker open");
        }

        let payload = MediationPayload {
            message_id: &pointer.id,
        };

        let mut request = self
            .client
            .post(&pointer.mediation_target)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&payload);

        if let Some(token) = &pointer.auth_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                breaker.record_failure();
                let detail = if e.is_timeout() {
                    format!("request timeout: {e}")
                } else if e.is_connect() {
                    format!("connection failed: {e}")
                } else {
                    format!("request failed: {e}")
                };
                warn!(
                    message_id = %pointer.id,
                    target = %pointer.mediation_target,
                    error = %detail,
                    "Mediation transport failure"
                );
                return MediationOutcome::error_connection(detail);
            }
        };

        let status = response.status().as_u16();
        let result = classify_status(status, self.config.treat_422_as_server);

        match result {
            MediationResult::Success => {
                breaker.record_success();
                debug!(message_id = %pointer.id, status, "Message delivered");
                MediationOutcome::success(status)
            }
            MediationResult::ErrorConfig => {
                // endpoint is alive, just misconfigured - not a breaker failure
                breaker.record_success();
                warn!(
                    message_id = %pointer.id,
                    target = %pointer.mediation_target,
                    status,
                    "Permanent endpoint error"
                );
                self.warn_misconfigured(pointer, status);
                MediationOutcome::error_config(status, format!("HTTP {status}"))
            }
            MediationResult::ErrorServer => {
                if status == 429 {
                    // downstream throttling, not an outage
                    breaker.record_success();
                } else {
                    breaker.record_failure();
                }
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u32>().ok());
                warn!(
                    message_id = %pointer.id,
                    status,
                    retry_after = ?retry_after,
                    "Transient server error"
                );
                MediationOutcome::error_server(Some(status), retry_after, format!("HTTP {status}"))
            }
            MediationResult::ErrorProcess => {
                breaker.record_failure();
                warn!(message_id = %pointer.id, status, "Processing error, retryable");
                MediationOutcome::error_process(Some(status), format!("HTTP {status}"))
            }
            MediationResult::ErrorConnection => {
                // classify_status never yields this; transport errors return earlier
                MediationOutcome::error_connection(format!("HTTP {status}"))
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.retry_base_delay + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn process(&self, pointer: &MessagePointer) -> MediationOutcome {
        if pointer.mediation_type != MediationType::Http {
            return MediationOutcome::error_config(
                0,
                format!("unsupported mediation type: {:?}", pointer.mediation_type),
            );
        }

        let mut attempt_no = 0;
        loop {
            let outcome = self.attempt(pointer).await;
            attempt_no += 1;

            if !outcome.result.is_retryable() || attempt_no >= self.config.max_attempts {
                return outcome;
            }

            let delay = self.retry_delay();
            debug!(
                message_id = %pointer.id,
                attempt = attempt_no,
                delay_ms = delay.as_millis() as u64,
                "Retrying mediation"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_contract() {
        assert_eq!(classify_status(200, false), MediationResult::Success);
        assert_eq!(classify_status(201, false), MediationResult::Success);

        assert_eq!(classify_status(400, false), MediationResult::ErrorConfig);
        assert_eq!(classify_status(404, false), MediationResult::ErrorConfig);
        assert_eq!(classify_status(409, false), MediationResult::ErrorConfig);

        assert_eq!(classify_status(429, false), MediationResult::ErrorServer);
        assert_eq!(classify_status(502, false), MediationResult::ErrorServer);
        assert_eq!(classify_status(503, false), MediationResult::ErrorServer);

        assert_eq!(classify_status(422, false), MediationResult::ErrorProcess);
        assert_eq!(classify_status(500, false), MediationResult::ErrorProcess);
        assert_eq!(classify_status(504, false), MediationResult::ErrorProcess);

        // unexpected codes default to server error
        assert_eq!(classify_status(302, false), MediationResult::ErrorServer);
        assert_eq!(classify_status(418, false), MediationResult::ErrorServer);
    }

    #[test]
    fn boundary_knob_moves_422() {
        assert_eq!(classify_status(422, true), MediationResult::ErrorServer);
    }
}
