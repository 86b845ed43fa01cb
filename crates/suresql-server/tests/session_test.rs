//! Session lifecycle tests: authenticate → refresh → expire over an
//! in-memory engine.

use std::sync::Arc;

use suresql_core::config::DbmsConfig;
use suresql_core::driver::{Driver, Record};
use suresql_core::error::Error;
use suresql_core::memory::MemoryDriver;
use suresql_core::metrics::HealthStatus;
use suresql_core::node::Node;
use suresql_core::schema::{CONFIG_TABLE, SETTINGS_TABLE, USERS_TABLE};
use suresql_server::auth::{authenticate, hash_credential, refresh};

const API_KEY: &str = "test-api-key";
const CLIENT_ID: &str = "test-client";
const PASSWORD: &str = "hunter2";

fn config_record() -> Record {
    Record::new(CONFIG_TABLE)
        .with("label", "test-node")
        .with("node_number", 1)
        .with("is_init_done", true)
        .with("api_key", API_KEY)
        .with("client_id", CLIENT_ID)
}

fn user_record(username: &str) -> Record {
    Record::new(USERS_TABLE)
        .with("id", 1)
        .with("username", username)
        .with("password", hash_credential(PASSWORD, API_KEY, CLIENT_ID))
        .with("role_name", "admin")
}

fn max_pool_setting(max: i64) -> Record {
    Record::new(SETTINGS_TABLE)
        .with("category", "connection")
        .with("data_type", "int")
        .with("setting_key", "max_pool")
        .with("int_value", max)
}

async fn test_node(internal: MemoryDriver) -> Arc<Node> {
    let node = Node::with_driver(Arc::new(internal), DbmsConfig::default())
        .await
        .expect("node");
    node.set_session_factory(Arc::new(|| {
        Box::pin(async { Ok(Arc::new(MemoryDriver::new()) as Arc<dyn Driver>) })
    }));
    node
}

async fn standard_node() -> Arc<Node> {
    test_node(
        MemoryDriver::new()
            .with_table(CONFIG_TABLE, vec![config_record()])
            .with_table(USERS_TABLE, vec![user_record("alice")]),
    )
    .await
}

#[tokio::test]
async fn test_authenticate_leases_a_session() {
    let node = standard_node().await;
    let record = authenticate(&node, "alice", PASSWORD).await.expect("auth");

    assert!(!record.token.is_empty());
    assert!(!record.refresh_token.is_empty());
    assert_ne!(record.token, record.refresh_token);
    assert!(record.token_expires_at <= record.refresh_expires_at);
    assert_eq!(record.username, "alice");

    // The session owns a pool entry under its access token.
    assert_eq!(node.pool.len(), 1);
    assert!(node.pool.get(&record.token).is_some());

    // And the store holds the record under both keys.
    assert_eq!(node.tokens.token_exist(&record.token), Some(record.clone()));
    assert_eq!(
        node.tokens.refresh_token_exist(&record.refresh_token),
        Some(record)
    );

    let snap = node.metrics_snapshot();
    assert_eq!(snap.authentication_attempts, 1);
    assert_eq!(snap.authentication_failures, 0);
    assert_eq!(snap.connections_created, 1);
    assert_eq!(snap.tokens_created, 1);
}

#[tokio::test]
async fn test_bad_credentials_are_indistinguishable() {
    let node = standard_node().await;

    let wrong_password = authenticate(&node, "alice", "wrong").await.unwrap_err();
    let unknown_user = authenticate(&node, "nobody", "wrong").await.unwrap_err();

    // Both branches collapse into the same generic failure.
    assert_eq!(wrong_password.to_string(), unknown_user.to_string());
    assert_eq!(wrong_password.status_code(), 401);
    assert!(node.pool.is_empty());
    assert_eq!(node.metrics_snapshot().authentication_failures, 2);
}

#[tokio::test]
async fn test_invalid_username_rejected_before_lookup() {
    let node = standard_node().await;
    let err = authenticate(&node, "bad name!", PASSWORD).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_ten_failures_degrade_health() {
    let node = standard_node().await;
    for _ in 0..10 {
        let _ = authenticate(&node, "alice", "wrong").await;
    }

    let snap = node.metrics_snapshot();
    assert_eq!(snap.authentication_attempts, 10);
    assert_eq!(snap.authentication_failures, 10);

    // No lock-out in the core: the next good login still works.
    let health = node.health().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert!(authenticate(&node, "alice", PASSWORD).await.is_ok());
}

#[tokio::test]
async fn test_refresh_rebinds_never_renames() {
    let node = standard_node().await;
    let old = authenticate(&node, "alice", PASSWORD).await.expect("auth");
    let old_driver = node.pool.get(&old.token).expect("old lease");

    let new = refresh(&node, &old.refresh_token).await.expect("refresh");

    // Brand-new pair, same pool size, old lease destroyed.
    assert_ne!(new.token, old.token);
    assert_ne!(new.refresh_token, old.refresh_token);
    assert_eq!(node.pool.len(), 1);
    assert!(node.pool.get(&old.token).is_none());
    assert!(node.pool.get(&new.token).is_some());

    // The old driver was really closed, not renamed.
    assert!(!old_driver.is_connected().await);
}

#[tokio::test]
async fn test_refresh_invalidates_old_records() {
    let node = standard_node().await;
    let old = authenticate(&node, "alice", PASSWORD).await.expect("auth");
    let _new = refresh(&node, &old.refresh_token).await.expect("refresh");

    // Old record is gone from both maps; replaying the refresh fails.
    assert!(node.tokens.token_exist(&old.token).is_none());
    assert!(node.tokens.refresh_token_exist(&old.refresh_token).is_none());
    let err = refresh(&node, &old.refresh_token).await.unwrap_err();
    assert_eq!(err.status_code(), 401);

    let snap = node.metrics_snapshot();
    assert_eq!(snap.refresh_tokens_used, 1);
    assert_eq!(snap.connections_closed, 1);
    assert_eq!(snap.connections_created, 2);
}

#[tokio::test]
async fn test_refresh_with_access_token_fails() {
    let node = standard_node().await;
    let record = authenticate(&node, "alice", PASSWORD).await.expect("auth");
    // Only the refresh key authorises a reissue.
    assert!(refresh(&node, &record.token).await.is_err());
}

#[tokio::test]
async fn test_pool_quota_rejects_excess_sessions() {
    let internal = MemoryDriver::new()
        .with_table(CONFIG_TABLE, vec![config_record()])
        .with_table(
            USERS_TABLE,
            vec![user_record("alice"), {
                Record::new(USERS_TABLE)
                    .with("id", 2)
                    .with("username", "bob")
                    .with("password", hash_credential(PASSWORD, API_KEY, CLIENT_ID))
            }, {
                Record::new(USERS_TABLE)
                    .with("id", 3)
                    .with("username", "carol")
                    .with("password", hash_credential(PASSWORD, API_KEY, CLIENT_ID))
            }],
        )
        .with_table(SETTINGS_TABLE, vec![max_pool_setting(2)]);
    let node = test_node(internal).await;
    assert_eq!(node.pool.effective_max(), 2);

    let outcomes = vec![
        authenticate(&node, "alice", PASSWORD).await,
        authenticate(&node, "bob", PASSWORD).await,
        authenticate(&node, "carol", PASSWORD).await,
    ];

    let rejected: Vec<&Error> = outcomes
        .iter()
        .filter_map(|o| o.as_ref().err())
        .collect();
    assert_eq!(rejected.len(), 1);
    assert!(matches!(rejected[0], Error::PoolExhausted { .. }));

    // Exactly one exhaustion event; capacity never exceeded.
    assert_eq!(node.metrics_snapshot().pool_exhaustion_count, 1);
    assert_eq!(node.pool.len(), 2);

    // The rejected session left no token behind.
    for record in outcomes.into_iter().flatten() {
        assert!(node.tokens.token_exist(&record.token).is_some());
    }
}

#[tokio::test]
async fn test_disabled_pool_shares_internal_connection() {
    let internal = MemoryDriver::new()
        .with_table(CONFIG_TABLE, vec![config_record()])
        .with_table(USERS_TABLE, vec![user_record("alice")])
        .with_table(
            SETTINGS_TABLE,
            vec![Record::new(SETTINGS_TABLE)
                .with("category", "connection")
                .with("data_type", "int")
                .with("setting_key", "pool_on")
                .with("int_value", 0)],
        );
    let node = test_node(internal).await;

    let record = authenticate(&node, "alice", PASSWORD).await.expect("auth");
    assert!(node.pool.is_empty());

    // Requests fall through to the internal driver.
    let db = node.connection_for_token(&record.token).expect("internal");
    assert!(db.is_connected().await);
}

#[tokio::test]
async fn test_live_pool_entries_always_have_tokens() {
    let node = standard_node().await;
    let first = authenticate(&node, "alice", PASSWORD).await.expect("auth");
    let second = refresh(&node, &first.refresh_token).await.expect("refresh");

    for key in node.pool.keys() {
        assert!(
            node.tokens.token_exist(&key).is_some(),
            "pool entry {key} has no live token"
        );
    }
    assert!(node.tokens.token_exist(&second.token).is_some());
}
