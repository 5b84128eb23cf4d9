//! Relay message router core.
//!
//! - `RouterManager`: composition root - routing, dedup, pool and consumer
//!   lifecycle, incremental reconfiguration
//! - `ProcessPool`: per-group FIFO workers with pool-wide concurrency and
//!   rate limiting, batch+group failure cascade
//! - `HttpMediator`: downstream delivery behind circuit breaker, retry, and
//!   timeout
//! - `WarningService` / `PoolMetrics`: thin operational output sinks
//! - `ConfigSync`: control-plane fetch, diff, and apply
//! - `LifecycleManager`: background maintenance tickers
//! - health routes for liveness/readiness probes

pub mod breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod mediator;
pub mod metrics;
pub mod pool;
pub mod runner;
pub mod warning;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use config::{
    spawn_config_sync_task, ConfigSync, ConfigSyncConfig, ControlPlaneDocument,
};
pub use error::RouterError;
pub use health::health_routes;
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use manager::{ConsumerFactory, ReloadReport, RouterManager, RouterManagerConfig};
pub use mediator::{HttpMediator, HttpMediatorConfig, HttpVersion, Mediator};
pub use metrics::{NullPoolMetrics, PoolMetrics, PrometheusPoolMetrics};
pub use pool::{DispatchJob, ProcessPool};
pub use warning::{WarningService, WarningServiceConfig};

pub type Result<T> = std::result::Result<T, RouterError>;
