//! Metrics recording interface and its Prometheus-backed implementation.
//!
//! The pools talk to the thin `PoolMetrics` trait and never read anything
//! back; production wires in [`PrometheusPoolMetrics`] (the exporter itself
//! is installed by the binary), tests use a recorder of their own.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub trait PoolMetrics: Send + Sync {
    fn initialize_pool(&self, pool_code: &str, concurrency: u32, queue_capacity: u32);

    fn message_submitted(&self, pool_code: &str);

    fn processing_success(&self, pool_code: &str, duration: Duration);

    fn processing_failure(&self, pool_code: &str, duration: Duration, result: &str);

    fn rate_limit_exceeded(&self, pool_code: &str);

    fn update_pool_gauges(
        &self,
        pool_code: &str,
        active: u32,
        available_permits: u32,
        queue_size: u32,
        group_count: u32,
    );
}

/// Records through the `metrics` facade with a `relay_` prefix.
#[derive(Debug, Default, Clone)]
pub struct PrometheusPoolMetrics;

impl PoolMetrics for PrometheusPoolMetrics {
    fn initialize_pool(&self, pool_code: &str, concurrency: u32, queue_capacity: u32) {
        gauge!("relay_pool_concurrency", "pool" => pool_code.to_string()).set(concurrency as f64);
        gauge!("relay_pool_group_queue_capacity", "pool" => pool_code.to_string())
            .set(queue_capacity as f64);
    }

    fn message_submitted(&self, pool_code: &str) {
        counter!("relay_messages_submitted_total", "pool" => pool_code.to_string()).increment(1);
    }

    fn processing_success(&self, pool_code: &str, duration: Duration) {
        counter!(
            "relay_messages_processed_total",
            "pool" => pool_code.to_string(),
            "result" => "SUCCESS"
        )
        .increment(1);
        histogram!("relay_mediation_duration_seconds", "pool" => pool_code.to_string())
            .record(duration.as_secs_f64());
    }

    fn processing_failure(&self, pool_code: &str, duration: Duration, result: &str) {
        counter!(
            "relay_messages_processed_total",
            "pool" => pool_code.to_string(),
            "result" => result.to_string()
        )
        .increment(1);
        histogram!("relay_mediation_duration_seconds", "pool" => pool_code.to_string())
            .record(duration.as_secs_f64());
    }

    fn rate_limit_exceeded(&self, pool_code: &str) {
        counter!("relay_rate_limit_exceeded_total", "pool" => pool_code.to_string()).increment(1);
    }

    fn update_pool_gauges(
        &self,
        pool_code: &str,
        active: u32,
        available_permits: u32,
        queue_size: u32,
        group_count: u32,
    ) {
        let pool = pool_code.to_string();
        gauge!("relay_pool_active_workers", "pool" => pool.clone()).set(active as f64);
        gauge!("relay_pool_available_permits", "pool" => pool.clone())
            .set(available_permits as f64);
        gauge!("relay_pool_queue_size", "pool" => pool.clone()).set(queue_size as f64);
        gauge!("relay_pool_message_groups", "pool" => pool).set(group_count as f64);
    }
}

/// Discards everything; the default for pools constructed without wiring.
#[derive(Debug, Default, Clone)]
pub struct NullPoolMetrics;

impl PoolMetrics for NullPoolMetrics {
    fn initialize_pool(&self, _: &str, _: u32, _: u32) {}
    fn message_submitted(&self, _: &str) {}
    fn processing_success(&self, _: &str, _: Duration) {}
    fn processing_failure(&self, _: &str, _: Duration, _: &str) {}
    fn rate_limit_exceeded(&self, _: &str) {}
    fn update_pool_gauges(&self, _: &str, _: u32, _: u32, _: u32, _: u32) {}
}

/// Router-level counters outside the pool interface.
pub fn record_consumer_poll(consumer: &str, message_count: usize) {
    counter!("relay_consumer_polls_total", "consumer" => consumer.to_string()).increment(1);
    if message_count > 0 {
        counter!("relay_consumer_messages_received_total", "consumer" => consumer.to_string())
            .increment(message_count as u64);
    }
}

pub fn record_parse_failures(consumer: &str, count: u32) {
    if count > 0 {
        counter!("relay_consumer_parse_failures_total", "consumer" => consumer.to_string())
            .increment(count as u64);
    }
}

pub fn record_route_outcome(outcome: &str) {
    counter!("relay_route_outcomes_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn set_in_flight_count(count: usize) {
    gauge!("relay_in_flight_messages").set(count as f64);
}
