//! HTTP routing and auth guards
//!
//! Three guard layers front the API: the API-key + client-id check on
//! `/db/*`, the bearer-token check on `/db/api/*`, and basic auth on the
//! monitoring and internal surfaces. Handlers answer with the standard
//! `{status, message, data}` wrapper and mirror the status code on the
//! transport status line; driver details are logged but never echoed to
//! the client.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::error;

use suresql_core::alert::AlertEngine;
use suresql_core::cleanup::CleanupSupervisor;
use suresql_core::error::{Error, ErrorCategory};
use suresql_core::node::{ping, Node};
use suresql_core::token::TokenRecord;

use crate::auth::{authenticate, refresh};
use crate::wire::{ConnectRequest, InsertRequest, QueryRequest, RefreshRequest, SqlRequest, StandardResponse};
use crate::{admin, dispatch, monitoring};

/// Header carrying the API key on `/db/*`
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header carrying the client id on `/db/*`
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Shared state behind every handler
#[derive(Clone)]
pub struct ServerState {
    /// The node runtime
    pub node: Arc<Node>,
    /// The alert engine backing `/monitoring/alerts`
    pub alerts: Arc<AlertEngine>,
}

/// The full gateway surface: a running node plus its supervisors.
pub struct Gateway {
    /// The node runtime
    pub node: Arc<Node>,
    /// Alert engine
    pub alerts: Arc<AlertEngine>,
    /// Expired-connection reclaimer
    pub cleanup: Arc<CleanupSupervisor>,
}

impl Gateway {
    /// Wire the supervisors around a node and start them.
    pub fn start(node: Arc<Node>) -> Self {
        let alerts = Arc::new(AlertEngine::new());
        alerts.start(Arc::clone(&node));
        let cleanup = Arc::new(CleanupSupervisor::new());
        cleanup.start(Arc::clone(&node));
        Self {
            node,
            alerts,
            cleanup,
        }
    }

    /// The axum router for this gateway.
    pub fn router(&self) -> Router {
        router(ServerState {
            node: Arc::clone(&self.node),
            alerts: Arc::clone(&self.alerts),
        })
    }

    /// Graceful shutdown: stop the supervisors, then close every pooled
    /// connection and the internal driver.
    pub async fn shutdown(&self) {
        self.cleanup.stop().await;
        self.alerts.stop().await;
        self.node.shutdown().await;
    }
}

/// Build the gateway router.
pub fn router(state: ServerState) -> Router {
    let api = Router::new()
        .route("/status", get(handle_db_status))
        .route("/getschema", get(handle_blocked_schema))
        .route("/sql", post(handle_sql))
        .route("/query", post(handle_query))
        .route("/querysql", post(handle_query_sql))
        .route("/insert", post(handle_insert))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    let db = Router::new()
        .route("/connect", post(handle_connect))
        .route("/refresh", post(handle_refresh))
        .route("/pingpong", get(handle_ping))
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_requests,
        ));

    Router::new()
        .nest("/db", db)
        .merge(monitoring::routes(state.clone()))
        .merge(admin::routes(state.clone()))
        .with_state(state)
}

/// `(status, wrapper)` pair every handler produces
pub type ApiResponse = (StatusCode, Json<StandardResponse>);

/// A 200 with payload
pub fn ok_response(message: impl Into<String>, data: impl serde::Serialize) -> ApiResponse {
    (StatusCode::OK, Json(StandardResponse::ok(message, data)))
}

/// Map an error to the wrapper, hiding driver internals behind `public`.
pub fn fail_response(err: &Error, public: &str) -> ApiResponse {
    error!(error = %err, "{public}");
    let status = err.status_code();
    let message = match err.category() {
        ErrorCategory::Driver | ErrorCategory::Internal => public.to_string(),
        _ => err.to_string(),
    };
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(StandardResponse::error(status, message)),
    )
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(StandardResponse::error(401, message)),
    )
        .into_response()
}

fn header_matches(request: &Request, name: &str, expected: &str) -> bool {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|presented| presented.as_bytes().ct_eq(expected.as_bytes()).into())
        .unwrap_or(false)
}

/// API key + client id guard on `/db/*`. Checks apply only to credentials
/// the node actually has configured.
async fn require_api_key(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    let (api_key, client_id) = state.node.api_credentials();
    if !api_key.is_empty() && !header_matches(&request, API_KEY_HEADER, &api_key) {
        return unauthorized("invalid or missing API key");
    }
    if !client_id.is_empty() && !header_matches(&request, CLIENT_ID_HEADER, &client_id) {
        return unauthorized("invalid or missing client id");
    }
    next.run(request).await
}

/// Bearer guard on `/db/api/*`: the token must be live in the store. The
/// matching record rides along in the request extensions.
async fn require_bearer(
    State(state): State<ServerState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return unauthorized("missing token");
    };
    let Some(record) = state.node.tokens.token_exist(token) else {
        return unauthorized("invalid or expired token");
    };
    request.extensions_mut().insert(record);
    next.run(request).await
}

/// Basic-auth guard for the monitoring and internal surfaces.
pub async fn require_basic(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    let (username, password) = state.node.internal_credentials();
    let expected = format!("{username}:{password}");

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| BASE64.decode(v).ok());

    let authorized = presented
        .map(|decoded| decoded.ct_eq(expected.as_bytes()).into())
        .unwrap_or(false);
    if !authorized {
        return unauthorized("basic authentication required");
    }
    next.run(request).await
}

/// Count every `/db/*` request, failed when the response is an error.
async fn track_requests(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    state
        .node
        .metrics
        .record_request(!response.status().is_client_error() && !response.status().is_server_error());
    response
}

async fn handle_ping() -> ApiResponse {
    ok_response(ping(), serde_json::Value::Null)
}

async fn handle_connect(
    State(state): State<ServerState>,
    Json(req): Json<ConnectRequest>,
) -> ApiResponse {
    match authenticate(&state.node, &req.username, &req.password).await {
        Ok(record) => ok_response("Authentication successful", record),
        Err(Error::PoolExhausted { .. }) => (
            // Kept at 406 on connect for client compatibility.
            StatusCode::NOT_ACCEPTABLE,
            Json(StandardResponse::error(
                406,
                "Failed to create database connection, quota exceeded",
            )),
        ),
        Err(e) => fail_response(&e, "Failed to create database connection"),
    }
}

async fn handle_refresh(
    State(state): State<ServerState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResponse {
    match refresh(&state.node, &req.refresh_token).await {
        Ok(record) => ok_response("Token refreshed successfully", record),
        Err(e @ Error::PoolExhausted { .. }) => fail_response(&e, "Connection pool full"),
        Err(Error::InvalidToken) => (
            StatusCode::UNAUTHORIZED,
            Json(StandardResponse::error(401, "Invalid or expired refresh token")),
        ),
        Err(e) => fail_response(&e, "Failed to create database connection"),
    }
}

async fn handle_db_status(
    State(state): State<ServerState>,
    Extension(token): Extension<TokenRecord>,
) -> ApiResponse {
    let db = match state.node.connection_for_token(&token.token) {
        Ok(db) => db,
        Err(e) => return fail_response(&e, "Cannot get DB connection"),
    };

    let mut status = state.node.status();
    match db.status().await {
        Ok(engine) => {
            status.dbms_driver = engine.dbms_driver;
            status.leader = engine.leader;
            status.dir_size = engine.dir_size;
            status.db_size = engine.db_size;
            status.last_backup = engine.last_backup;
        }
        Err(e) => return fail_response(&e, "Cannot get DB status"),
    }
    ok_response("Database status retrieved", status)
}

async fn handle_blocked_schema() -> ApiResponse {
    (
        StatusCode::UNAUTHORIZED,
        Json(StandardResponse::error(401, "schema is not exposed to API")),
    )
}

async fn handle_sql(
    State(state): State<ServerState>,
    Extension(token): Extension<TokenRecord>,
    Json(req): Json<SqlRequest>,
) -> ApiResponse {
    let db = match state.node.connection_for_token(&token.token) {
        Ok(db) => db,
        Err(e) => return fail_response(&e, "Cannot get DB connection"),
    };
    match dispatch::execute_sql(&state.node, db.as_ref(), &req).await {
        Ok(resp) => ok_response("SQL executed successfully", resp),
        Err(e) => fail_response(&e, "Failed to execute SQL statement"),
    }
}

async fn handle_query(
    State(state): State<ServerState>,
    Extension(token): Extension<TokenRecord>,
    Json(req): Json<QueryRequest>,
) -> ApiResponse {
    let db = match state.node.connection_for_token(&token.token) {
        Ok(db) => db,
        Err(e) => return fail_response(&e, "Cannot get DB connection"),
    };
    match dispatch::query(&state.node, db.as_ref(), &req).await {
        Ok(resp) => ok_response("Query executed successfully", resp),
        Err(e) => fail_response(&e, "Failed to execute query"),
    }
}

async fn handle_query_sql(
    State(state): State<ServerState>,
    Extension(token): Extension<TokenRecord>,
    Json(req): Json<SqlRequest>,
) -> ApiResponse {
    let db = match state.node.connection_for_token(&token.token) {
        Ok(db) => db,
        Err(e) => return fail_response(&e, "Cannot get DB connection"),
    };
    match dispatch::query_sql(&state.node, db.as_ref(), &req).await {
        Ok(resp) => ok_response("SQL executed successfully", resp),
        Err(e) => fail_response(&e, "Failed to execute query"),
    }
}

async fn handle_insert(
    State(state): State<ServerState>,
    Extension(token): Extension<TokenRecord>,
    Json(req): Json<InsertRequest>,
) -> ApiResponse {
    let db = match state.node.connection_for_token(&token.token) {
        Ok(db) => db,
        Err(e) => return fail_response(&e, "Cannot get DB connection"),
    };
    match dispatch::insert(&state.node, db.as_ref(), &req).await {
        Ok(resp) => ok_response(
            format!("Successfully inserted {} records", resp.rows_affected),
            resp,
        ),
        Err(e) => fail_response(&e, "Failed to insert records"),
    }
}
