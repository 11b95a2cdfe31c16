//! Client-facing API: `POST /route` and the realtime Session WebSocket upgrade.
//!
//! This is intentionally a thin layer: all routing logic lives in [`crate::router`]
//! and [`crate::session`]. Handlers translate HTTP concerns (status codes, JSON
//! bodies, the WebSocket upgrade handshake) into calls against those components.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{CanaryInfo, ReasonCode, RequestEnvelope, Tier};
use crate::error::AppError;
use crate::traffic::TrafficEntry;
use crate::AppState;

/// Build the client-facing axum router (port `gateway.client_port`).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(super::health::healthz))
        .route("/route", post(route_request))
        .route("/session", get(session_upgrade))
        .with_state(state)
}

/// Trimmed feature summary returned to the caller (§6): enough to explain a
/// decision without exposing the full internal `RouterFeatures` record.
#[derive(Debug, Serialize)]
struct FeaturesSummary {
    token_count: u64,
    novelty_score: f64,
    request_complexity: f64,
    domain_flags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RouteResponse {
    tier: Tier,
    confidence: f64,
    decision_time_ms: u64,
    reason_code: ReasonCode,
    canary: bool,
    features_summary: FeaturesSummary,
}

/// `POST /route`: routes the envelope, runs it against the configured Tier
/// Executor, records the outcome, and returns the resulting `RoutingDecision`.
async fn route_request(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<RequestEnvelope>,
) -> Result<Json<RouteResponse>, AppError> {
    let decision = state.orchestrator.route(&envelope).await;

    let outcome = state.tier_executor.execute(decision.tier, &envelope).await;
    state
        .orchestrator
        .record_outcome(
            &decision,
            &envelope.tenant_id,
            envelope.user_id.as_deref(),
            outcome.success,
            outcome.latency_ms,
            outcome.quality,
            outcome.cost,
        )
        .await;

    let canary = decision
        .canary_info
        .as_ref()
        .map(|c: &CanaryInfo| c.is_canary)
        .unwrap_or(false);

    let mut entry = TrafficEntry::new(
        envelope.tenant_id.clone(),
        decision.tier,
        decision.reason_code,
        decision.decision_time_ms,
        outcome.success,
    );
    if canary {
        entry = entry.mark_canary();
    }
    if !outcome.success {
        entry = entry.with_error("tier execution reported failure");
    }
    state.traffic.push(entry);

    Ok(Json(RouteResponse {
        tier: decision.tier,
        confidence: decision.confidence,
        decision_time_ms: decision.decision_time_ms,
        reason_code: decision.reason_code,
        canary,
        features_summary: FeaturesSummary {
            token_count: decision.features.token_count,
            novelty_score: decision.features.novelty_score,
            request_complexity: decision.features.request_complexity,
            domain_flags: decision.features.domain_flags,
        },
    }))
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    tenant_id: String,
}

/// `GET /session?tenant_id=...`: upgrades to a WebSocket and hands the
/// connection to the Session Manager for its lifetime.
async fn session_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let connection_id = Uuid::new_v4().to_string();
    ws.on_upgrade(move |socket| async move {
        state
            .sessions
            .clone()
            .run_connection(connection_id, query.tenant_id, socket)
            .await;
    })
}
