//! Operational endpoints: liveness, readiness, startup, and a small stats
//! surface. Hosted by the binary; bound before consumers start so probes
//! answer from the first moment of the process lifetime.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::sync::Arc;

use crate::manager::RouterManager;
use crate::warning::WarningService;

#[derive(Clone)]
pub struct HealthState {
    pub manager: Arc<RouterManager>,
    pub warnings: Arc<WarningService>,
}

pub fn health_routes(manager: Arc<RouterManager>, warnings: Arc<WarningService>) -> Router {
    let state = HealthState { manager, warnings };

    Router::new()
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/health/startup", get(startup))
        .route("/stats", get(stats))
        .with_state(state)
}

#[derive(Serialize)]
struct ProbeBody {
    status: &'static str,
}

async fn liveness() -> impl IntoResponse {
    Json(ProbeBody { status: "alive" })
}

async fn readiness(State(state): State<HealthState>) -> impl IntoResponse {
    if state.manager.is_ready().await {
        (StatusCode::OK, Json(ProbeBody { status: "ready" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeBody {
                status: "not_ready",
            }),
        )
    }
}

/// Same check as readiness; deployments give this probe the longer budget.
async fn startup(state: State<HealthState>) -> impl IntoResponse {
    readiness(state).await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsBody {
    pools: Vec<relay_core::PoolSnapshot>,
    in_flight: usize,
    draining_pools: usize,
    consumers: Vec<String>,
    warnings_unacknowledged: usize,
    has_critical_warnings: bool,
}

async fn stats(State(state): State<HealthState>) -> impl IntoResponse {
    Json(StatsBody {
        pools: state.manager.pool_snapshots(),
        in_flight: state.manager.in_flight_count(),
        draining_pools: state.manager.draining_pool_count(),
        consumers: state.manager.consumer_ids().await,
        warnings_unacknowledged: state.warnings.unacknowledged_count(),
        has_critical_warnings: state.warnings.has_critical(),
    })
}
