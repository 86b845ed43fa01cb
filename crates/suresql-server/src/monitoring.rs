//! Monitoring surface
//!
//! `/health` and `/ready` are open probes; everything under `/monitoring`
//! sits behind basic auth: the full metrics snapshot, pool and token
//! breakdowns, the alert history with level/limit filters, and a detailed
//! health report that turns 503 when the node is unhealthy.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use suresql_core::alert::AlertLevel;
use suresql_core::metrics::HealthStatus;
use suresql_core::node::{APP_NAME, APP_VERSION};

use crate::routes::{ok_response, require_basic, ApiResponse, ServerState};
use crate::wire::StandardResponse;

/// Readiness refuses traffic above this pool usage
const READINESS_POOL_LIMIT_PCT: f64 = 95.0;

/// Monitoring and probe routes.
pub fn routes(state: ServerState) -> Router<ServerState> {
    let guarded = Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/metrics/pool", get(handle_pool_metrics))
        .route("/metrics/tokens", get(handle_token_metrics))
        .route("/alerts", get(handle_alerts).delete(handle_clear_alerts))
        .route("/alerts/stats", get(handle_alert_stats))
        .route("/health/detailed", get(handle_detailed_health))
        .layer(middleware::from_fn_with_state(state, require_basic));

    Router::new()
        .route("/health", get(handle_health))
        .route("/ready", get(handle_readiness))
        .nest("/monitoring", guarded)
}

/// Liveness probe: answers while the process runs.
async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": APP_VERSION,
        "service": APP_NAME,
    }))
}

/// Readiness probe: requires the internal connection and pool headroom.
async fn handle_readiness(State(state): State<ServerState>) -> (StatusCode, Json<serde_json::Value>) {
    if !state.node.internal_driver().is_connected().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not ready",
                "reason": "database connection failed",
            })),
        );
    }

    let usage = state.node.pool.usage_pct();
    if usage >= READINESS_POOL_LIMIT_PCT {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not ready",
                "reason": "connection pool near exhaustion",
                "usage": usage,
            })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "version": APP_VERSION,
        })),
    )
}

async fn handle_metrics(State(state): State<ServerState>) -> ApiResponse {
    ok_response("Metrics retrieved successfully", state.node.metrics_snapshot())
}

async fn handle_pool_metrics(State(state): State<ServerState>) -> ApiResponse {
    ok_response("Pool metrics retrieved successfully", pool_stats(&state))
}

fn pool_stats(state: &ServerState) -> serde_json::Value {
    let snap = state.node.metrics_snapshot();
    json!({
        "active_connections": snap.connections_active,
        "max_pool_size": snap.connection_pool_size,
        "usage_percentage": snap.connection_pool_usage_pct,
        "total_created": snap.connections_created,
        "total_closed": snap.connections_closed,
        "pool_exhaustion_count": snap.pool_exhaustion_count,
        "last_exhaustion": snap.last_pool_exhaustion,
        "available_slots": snap.connection_pool_size.saturating_sub(snap.connections_active),
    })
}

async fn handle_token_metrics(State(state): State<ServerState>) -> ApiResponse {
    ok_response("Token metrics retrieved successfully", token_stats(&state))
}

fn token_stats(state: &ServerState) -> serde_json::Value {
    let snap = state.node.metrics_snapshot();
    json!({
        "tokens_active": snap.tokens_active,
        "tokens_created": snap.tokens_created,
        "tokens_expired": snap.tokens_expired,
        "refresh_tokens_active": snap.refresh_tokens_active,
        "refresh_tokens_used": snap.refresh_tokens_used,
    })
}

#[derive(Debug, Default, Deserialize)]
struct AlertsQuery {
    level: Option<String>,
    limit: Option<usize>,
}

fn parse_level(raw: &str) -> Option<AlertLevel> {
    match raw.to_ascii_uppercase().as_str() {
        "INFO" => Some(AlertLevel::Info),
        "WARNING" => Some(AlertLevel::Warning),
        "CRITICAL" => Some(AlertLevel::Critical),
        _ => None,
    }
}

async fn handle_alerts(
    State(state): State<ServerState>,
    Query(query): Query<AlertsQuery>,
) -> ApiResponse {
    let alerts = match query.level.as_deref().and_then(parse_level) {
        Some(level) => state.alerts.by_level(level),
        None => state.alerts.recent(query.limit.unwrap_or(20)),
    };
    let count = alerts.len();
    ok_response(
        "Alerts retrieved successfully",
        json!({
            "alerts": alerts,
            "count": count,
        }),
    )
}

async fn handle_alert_stats(State(state): State<ServerState>) -> ApiResponse {
    ok_response("Alert stats retrieved successfully", state.alerts.stats())
}

async fn handle_clear_alerts(State(state): State<ServerState>) -> ApiResponse {
    state.alerts.clear();
    ok_response("Alerts cleared successfully", serde_json::Value::Null)
}

async fn handle_detailed_health(State(state): State<ServerState>) -> (StatusCode, Json<StandardResponse>) {
    let health = state.node.health().await;
    let status = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        // Degraded still answers 200 so load balancers keep routing.
        _ => StatusCode::OK,
    };

    let data = json!({
        "health": health,
        "pool_stats": pool_stats(&state),
        "token_stats": token_stats(&state),
        "recent_alerts": state.alerts.recent(5),
    });
    (
        status,
        Json(StandardResponse {
            status: status.as_u16(),
            message: "Health status retrieved".to_string(),
            data,
        }),
    )
}
