//! Session protocol: authenticate, refresh, expire
//!
//! Credentials are verified against the `_users` table with a sha256 hash
//! peppered by the node's API key and client id, compared in constant time.
//! A missing user still pays for one hash computation so the two failure
//! branches are timing-equal, and both collapse into the same generic
//! invalid-credentials answer. The in-memory password is cleared the moment
//! verification completes.
//!
//! Tokens are opaque: 384 bits of system randomness each (three times the
//! 16-byte base entropy), base64url encoded. A refresh is always
//! close-and-reissue: the old access key and its pooled driver are
//! destroyed, never renamed.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use suresql_core::driver::{Filter, Record};
use suresql_core::error::{Error, Result};
use suresql_core::node::Node;
use suresql_core::schema::USERS_TABLE;
use suresql_core::token::TokenRecord;
use suresql_core::validate::validate_username;

/// Base entropy in bytes; tokens carry three times this
const BASE_TOKEN_BYTES: usize = 16;
/// Token length multiplier over the base entropy
const TOKEN_LENGTH_MULTIPLIER: usize = 3;

/// One `_users` row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRow {
    /// Auto-assigned id
    #[serde(default)]
    pub id: i64,
    /// Unique account name
    #[serde(default)]
    pub username: String,
    /// Peppered credential hash; never leaves the node
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Role name; storage only, no authorisation semantics
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_name: String,
    /// Creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl UserRow {
    /// Build from a database record.
    pub fn from_record(record: Record) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(record.data))
            .map_err(|e| Error::internal(format!("malformed {USERS_TABLE} row: {e}")))
    }

    /// Render as an insertable record, letting the store assign the id.
    pub fn to_record(&self) -> Result<Record> {
        let value = serde_json::to_value(self)
            .map_err(|e| Error::internal(format!("cannot serialize user row: {e}")))?;
        let serde_json::Value::Object(mut data) = value else {
            return Err(Error::internal("user row did not serialize to an object"));
        };
        data.remove("id");
        Ok(Record {
            table_name: USERS_TABLE.to_string(),
            data,
        })
    }
}

/// Hash a password with the node's pepper (API key + client id).
pub fn hash_credential(password: &str, api_key: &str, client_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(b"\x00");
    hasher.update(api_key.as_bytes());
    hasher.update(b"\x00");
    hasher.update(client_id.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Constant-time comparison of a stored hash against a freshly computed one.
pub fn verify_credential(stored: &str, password: &str, api_key: &str, client_id: &str) -> bool {
    let computed = hash_credential(password, api_key, client_id);
    stored.as_bytes().ct_eq(computed.as_bytes()).into()
}

/// Mint one opaque token: 3 × 16 bytes of system randomness, base64url.
pub fn mint_token() -> Result<String> {
    let mut bytes = [0u8; BASE_TOKEN_BYTES * TOKEN_LENGTH_MULTIPLIER];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| Error::internal("system randomness unavailable"))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Look up a user by name. The password hash stays on the returned row;
/// callers clear it immediately after verification.
async fn find_user(node: &Node, username: &str) -> Result<UserRow> {
    let record = node
        .internal_driver()
        .select_one_with_filter(USERS_TABLE, &Filter::leaf("username", "=", username))
        .await?;
    UserRow::from_record(record)
}

fn new_token_record(node: &Node, user_id: i64, username: &str) -> Result<TokenRecord> {
    let resolved = node.resolved();
    let now = Utc::now();
    let record = TokenRecord {
        user_id: user_id.to_string(),
        username: username.to_string(),
        token: mint_token()?,
        refresh_token: mint_token()?,
        token_expires_at: now
            + ChronoDuration::from_std(resolved.token_exp)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
        refresh_expires_at: now
            + ChronoDuration::from_std(resolved.refresh_exp)
                .unwrap_or_else(|_| ChronoDuration::hours(48)),
        created_at: now,
    };
    node.tokens.save_token(&record);
    node.metrics.record_token_created();
    Ok(record)
}

/// Authenticate a user and lease a session.
///
/// On success the session owns a fresh driver admitted to the pool under
/// the new access token (or shares the internal driver when pooling is
/// off). Admission failure counts as pool exhaustion and surfaces as a
/// quota error.
pub async fn authenticate(node: &Node, username: &str, password: &str) -> Result<TokenRecord> {
    validate_username(username)?;

    let (api_key, client_id) = node.api_credentials();

    let mut user = match find_user(node, username).await {
        Ok(user) => user,
        Err(_) => {
            // Unknown user: compute the hash anyway so both failure
            // branches take the same time.
            let _ = hash_credential(password, &api_key, &client_id);
            node.metrics.record_authentication(false);
            return Err(Error::InvalidCredentials);
        }
    };

    let valid = verify_credential(&user.password, password, &api_key, &client_id);
    // The in-memory password ends here, on every branch.
    user.password.clear();
    if !valid {
        node.metrics.record_authentication(false);
        warn!(username, "password mismatch");
        return Err(Error::InvalidCredentials);
    }

    if !node.pool.is_enabled() {
        // Pooling off: the session rides the internal connection.
        let record = new_token_record(node, user.id, &user.username)?;
        node.metrics.record_authentication(true);
        return Ok(record);
    }

    let driver = match node.open_session_driver().await {
        Ok(driver) => driver,
        Err(e) => {
            node.metrics.record_authentication(false);
            return Err(e);
        }
    };
    let record = new_token_record(node, user.id, &user.username)?;
    if let Err(e) = node.pool.put(record.token.clone(), driver.clone()) {
        node.metrics.record_pool_exhaustion();
        node.metrics.record_authentication(false);
        node.tokens.delete_record(&record);
        let _ = driver.close().await;
        return Err(e);
    }
    node.metrics.record_connection_created();
    node.metrics.record_authentication(true);
    info!(username = %user.username, "session established");
    Ok(record)
}

/// Reissue a token pair against a live refresh token.
///
/// The old access key and its driver are always destroyed; the new session
/// gets a brand-new driver under a brand-new key.
pub async fn refresh(node: &Node, refresh_token: &str) -> Result<TokenRecord> {
    let Some(old) = node.tokens.refresh_token_exist(refresh_token) else {
        return Err(Error::InvalidToken);
    };

    // Best-effort close of the old driver before anything else.
    if let Some(disposed) = node.pool.close(&old.token).await {
        if disposed.is_ok() {
            node.metrics.record_connection_closed();
        }
    }

    let user_id: i64 = old.user_id.parse().unwrap_or_default();
    if !node.pool.is_enabled() {
        node.tokens.delete_record(&old);
        let record = new_token_record(node, user_id, &old.username)?;
        node.metrics.record_refresh_token_used();
        return Ok(record);
    }

    let driver = node.open_session_driver().await?;
    let record = new_token_record(node, user_id, &old.username)?;
    if let Err(e) = node.pool.put(record.token.clone(), driver.clone()) {
        node.metrics.record_pool_exhaustion();
        node.tokens.delete_record(&record);
        let _ = driver.close().await;
        return Err(e);
    }
    node.metrics.record_connection_created();
    node.metrics.record_refresh_token_used();

    // Both halves of the old record go away; the bijection between live
    // records and the two maps holds at every observable moment.
    node.tokens.delete_record(&old);
    info!(username = %old.username, "token refreshed");
    Ok(record)
}
