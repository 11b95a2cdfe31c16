//! Admin API (port `gateway.admin_port`) — operator-facing introspection and
//! control endpoints (§9b Administrative surface).
//!
//! Separated onto its own port so it can be network-restricted independently
//! of the client API (e.g. reachable only from an internal network).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::domain::{CanaryConfig, Tier};
use crate::error::AppError;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/traffic", get(traffic))
        .route("/admin/config", get(config))
        .route("/admin/tenants/:tenant_id/reset_learning", post(reset_learning))
        .route("/admin/tenants/:tenant_id/calibrate", post(calibrate))
        .route("/admin/tenants/:tenant_id/canary", post(set_canary).get(get_canary))
        .route("/admin/tenants/:tenant_id/statistics", get(get_statistics))
        .with_state(state)
}

/// `GET /admin/health` — liveness plus a live connection count.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "active_connections": state.sessions.connection_count(),
    }))
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// `GET /admin/traffic?limit=N` — recent routing decisions plus aggregate stats.
async fn traffic(State(state): State<Arc<AppState>>, Query(q): Query<TrafficQuery>) -> impl IntoResponse {
    let entries = state.traffic.recent(q.limit).await;
    let stats = state.traffic.stats().await;
    Json(json!({ "stats": stats, "entries": entries }))
}

/// `GET /admin/config` — the live config, snapshotted from the hot-reloadable handle.
async fn config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cfg = state.config.read().await.clone();
    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "traffic_log_capacity": cfg.gateway.traffic_log_capacity,
            "rate_limit_rpm": cfg.gateway.rate_limit_rpm,
        },
        "session": cfg.session,
        "queue": cfg.queue,
        "tenant_count": cfg.tenants.len(),
    }))
}

/// `POST /admin/tenants/:tenant_id/reset_learning` (§9b administrative surface):
/// wipes the tenant's bandit arm statistics so it starts exploring fresh.
async fn reset_learning(State(state): State<Arc<AppState>>, Path(tenant_id): Path<String>) -> impl IntoResponse {
    state.orchestrator.bandit().reset_tenant(&tenant_id);
    Json(json!({ "tenant_id": tenant_id, "reset": true }))
}

/// `POST /admin/tenants/:tenant_id/calibrate`: this build never loads a real
/// `ClassifierModel` (model loading is out of scope), so calibration has
/// nothing to fit against and acknowledges that rather than failing.
async fn calibrate(State(_state): State<Arc<AppState>>, Path(tenant_id): Path<String>) -> impl IntoResponse {
    Json(json!({
        "tenant_id": tenant_id,
        "calibrated": false,
        "reason": "no calibrated classifier model is configured for this build",
    }))
}

/// `POST /admin/tenants/:tenant_id/canary` — install a canary configuration.
async fn set_canary(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Json(config): Json<CanaryConfig>,
) -> Result<impl IntoResponse, AppError> {
    state.orchestrator.canary().set_config(&tenant_id, config);
    Ok(Json(json!({ "tenant_id": tenant_id, "canary": config })))
}

/// `GET /admin/tenants/:tenant_id/canary` — current canary configuration.
async fn get_canary(State(state): State<Arc<AppState>>, Path(tenant_id): Path<String>) -> impl IntoResponse {
    Json(state.orchestrator.canary().config_for(&tenant_id))
}

/// `GET /admin/tenants/:tenant_id/statistics` (§9b `get_statistics`): bandit arm
/// stats per tier plus the tenant's canary configuration.
async fn get_statistics(State(state): State<Arc<AppState>>, Path(tenant_id): Path<String>) -> impl IntoResponse {
    let bandit = state.orchestrator.bandit();
    let arms: serde_json::Map<String, serde_json::Value> = Tier::ALL
        .iter()
        .map(|tier| {
            let stats = bandit.arm_stats(&tenant_id, *tier);
            (
                tier.as_str().to_string(),
                json!({
                    "pulls": stats.pulls,
                    "mean_reward": stats.mean_reward(),
                }),
            )
        })
        .collect();

    let (misroute_rate, expected_vs_actual_cost, expected_vs_actual_latency) =
        state.orchestrator.outcome_stats(&tenant_id);

    Json(json!({
        "tenant_id": tenant_id,
        "bandit_arms": arms,
        "canary": state.orchestrator.canary().config_for(&tenant_id),
        "misroute_rate": misroute_rate,
        "expected_vs_actual_cost": expected_vs_actual_cost,
        "expected_vs_actual_latency": expected_vs_actual_latency,
        "cost_drift": format!("{:?}", crate::metrics::cost_drift_severity(expected_vs_actual_cost)),
        "latency_drift": format!("{:?}", crate::metrics::latency_drift_severity(expected_vs_actual_latency)),
    }))
}
