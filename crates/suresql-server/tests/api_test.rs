//! End-to-end API tests over the axum router with an in-memory engine.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tower::ServiceExt;

use suresql_core::alert::AlertEngine;
use suresql_core::config::DbmsConfig;
use suresql_core::driver::{Driver, Record};
use suresql_core::memory::MemoryDriver;
use suresql_core::node::Node;
use suresql_core::schema::{CONFIG_TABLE, USERS_TABLE};
use suresql_server::auth::hash_credential;
use suresql_server::{router, ServerState};

const API_KEY: &str = "k-123";
const CLIENT_ID: &str = "c-456";
const PASSWORD: &str = "hunter2";
const ADMIN_USER: &str = "ops";
const ADMIN_PASS: &str = "ops-secret";

async fn test_router() -> (Router, Arc<Node>) {
    let internal = MemoryDriver::new()
        .with_table(
            CONFIG_TABLE,
            vec![Record::new(CONFIG_TABLE)
                .with("label", "api-test")
                .with("node_number", 1)
                .with("is_init_done", true)
                .with("api_key", API_KEY)
                .with("client_id", CLIENT_ID)],
        )
        .with_table(
            USERS_TABLE,
            vec![Record::new(USERS_TABLE)
                .with("id", 1)
                .with("username", "alice")
                .with("password", hash_credential(PASSWORD, API_KEY, CLIENT_ID))
                .with("role_name", "admin")],
        );

    let dbms = DbmsConfig {
        username: ADMIN_USER.to_string(),
        password: ADMIN_PASS.to_string(),
        ..Default::default()
    };
    let node = Node::with_driver(Arc::new(internal), dbms).await.expect("node");
    node.set_session_factory(Arc::new(|| {
        Box::pin(async { Ok(Arc::new(MemoryDriver::new()) as Arc<dyn Driver>) })
    }));

    let state = ServerState {
        node: Arc::clone(&node),
        alerts: Arc::new(AlertEngine::new()),
    };
    (router(state), node)
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", API_KEY)
        .header("x-client-id", CLIENT_ID)
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn post_json_bearer(path: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", API_KEY)
        .header("x-client-id", CLIENT_ID)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn connect(router: &Router) -> String {
    let response = router
        .clone()
        .oneshot(post_json(
            "/db/connect",
            json!({"username": "alice", "password": PASSWORD}),
        ))
        .await
        .expect("connect");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    body["data"]["token"].as_str().expect("token").to_string()
}

#[tokio::test]
async fn test_health_probe_is_open() {
    let (router, _node) = test_router().await;
    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "SureSQL");
}

#[tokio::test]
async fn test_connect_requires_api_key() {
    let (router, _node) = test_router().await;
    let request = Request::builder()
        .method("POST")
        .uri("/db/connect")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"username": "alice", "password": PASSWORD}).to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_api_requires_bearer() {
    let (router, _node) = test_router().await;
    let request = Request::builder()
        .method("POST")
        .uri("/db/api/query")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", API_KEY)
        .header("x-client-id", CLIENT_ID)
        .body(Body::from(json!({"table": "orders"}).to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_single_row_query_on_empty_table() {
    let (router, _node) = test_router().await;
    let token = connect(&router).await;

    let response = router
        .oneshot(post_json_bearer(
            "/db/api/query",
            &token,
            json!({
                "table": "orders",
                "single_row": true,
                "condition": {"field": "id", "operator": "=", "value": 42}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], 200);
    assert_eq!(body["data"]["count"], 0);
    assert_eq!(body["data"]["records"], json!([]));
    assert!(body["data"]["execution_time"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn test_two_statement_exec_tallies_two_rows() {
    let (router, _node) = test_router().await;
    let token = connect(&router).await;

    let response = router
        .oneshot(post_json_bearer(
            "/db/api/sql",
            &token,
            json!({
                "statements": [
                    "INSERT INTO t VALUES(1)",
                    "INSERT INTO t VALUES(2)"
                ]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["data"]["rows_affected"], 2);
    assert_eq!(body["data"]["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_heterogeneous_insert_produces_two_tallies() {
    let (router, _node) = test_router().await;
    let token = connect(&router).await;

    let response = router
        .oneshot(post_json_bearer(
            "/db/api/insert",
            &token,
            json!({
                "records": [
                    {"TableName": "t1", "Data": {"id": 1}},
                    {"TableName": "t2", "Data": {"id": 1}}
                ],
                "same_table": false
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["data"]["rows_affected"], 2);
    assert_eq!(body["data"]["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_refresh_invalidates_old_access_key() {
    let (router, node) = test_router().await;
    let token = connect(&router).await;
    let refresh_token = node
        .tokens
        .token_exist(&token)
        .expect("record")
        .refresh_token;
    let size_before = node.pool.len();

    let response = router
        .clone()
        .oneshot(post_json(
            "/db/refresh",
            json!({"refresh_token": refresh_token}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let new_token = body["data"]["token"].as_str().unwrap().to_string();
    assert_ne!(new_token, token);
    assert_eq!(node.pool.len(), size_before);

    // The old access key answers "no connection" now.
    let response = router
        .oneshot(post_json_bearer(
            "/db/api/query",
            &token,
            json!({"table": "orders"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_internal_table_is_forbidden() {
    let (router, _node) = test_router().await;
    let token = connect(&router).await;

    let response = router
        .oneshot(post_json_bearer(
            "/db/api/query",
            &token,
            json!({"table": "_users"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_monitoring_requires_basic_auth() {
    let (router, _node) = test_router().await;

    let response = router
        .clone()
        .oneshot(Request::get("/monitoring/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let credentials = BASE64.encode(format!("{ADMIN_USER}:{ADMIN_PASS}"));
    let response = router
        .oneshot(
            Request::get("/monitoring/metrics")
                .header(header::AUTHORIZATION, format!("Basic {credentials}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["data"]["connections_created"].is_number());
}

#[tokio::test]
async fn test_admin_user_lifecycle() {
    let (router, _node) = test_router().await;
    let credentials = BASE64.encode(format!("{ADMIN_USER}:{ADMIN_PASS}"));
    let basic = format!("Basic {credentials}");

    // Create.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/suresql/iusers")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, &basic)
                .body(Body::from(
                    json!({"username": "bob", "password": "pw-bob", "role_name": "reader"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Duplicate create conflicts.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/suresql/iusers")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, &basic)
                .body(Body::from(
                    json!({"username": "bob", "password": "pw-bob"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // List strips password hashes.
    let response = router
        .clone()
        .oneshot(
            Request::get("/suresql/iusers")
                .header(header::AUTHORIZATION, &basic)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    let users = body["data"].as_array().expect("users");
    assert_eq!(users.len(), 2);
    for user in users {
        assert!(user.get("password").is_none());
    }

    // Delete, then the user is gone.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/suresql/iusers?username=bob")
                .header(header::AUTHORIZATION, &basic)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/suresql/iusers?username=bob")
                .header(header::AUTHORIZATION, &basic)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
