//! Session token records and the dual-TTL token store
//!
//! A token record carries an opaque access/refresh pair with absolute
//! expiries. The store registers every record under both keys, in two TTL
//! maps with different lifetimes. The store is the only source of truth for
//! token liveness: no request succeeds on an access token absent from it,
//! and a refresh succeeds iff the refresh key is live (access liveness is
//! not consulted at refresh).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::ttl_map::TtlMap;

/// One issued token pair. Both strings are opaque; the access token alone
/// identifies the session's pool entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Owning user id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    /// Owning user name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Access token
    pub token: String,
    /// Refresh token
    pub refresh_token: String,
    /// Absolute access expiry
    #[serde(rename = "token_expired_at")]
    pub token_expires_at: DateTime<Utc>,
    /// Absolute refresh expiry; never earlier than the access expiry
    #[serde(rename = "refresh_expired_at")]
    pub refresh_expires_at: DateTime<Utc>,
    /// Issue time
    pub created_at: DateTime<Utc>,
}

/// Two coupled TTL maps keyed by access token and refresh token.
#[derive(Clone)]
pub struct TokenStore {
    access: TtlMap<TokenRecord>,
    refresh: TtlMap<TokenRecord>,
}

impl TokenStore {
    /// Create a store with sweepers running every `tick`.
    ///
    /// The access TTL must be shorter than the refresh TTL; a violation is
    /// logged and the refresh TTL is stretched to match.
    pub fn new(token_exp: Duration, refresh_exp: Duration, tick: Duration) -> Self {
        let refresh_exp = Self::checked_refresh_exp(token_exp, refresh_exp);
        Self {
            access: TtlMap::new(token_exp, tick),
            refresh: TtlMap::new(refresh_exp, tick),
        }
    }

    /// Create a store without background sweepers (tests drive expiry via
    /// [`TokenStore::sweep_now`]).
    pub fn unswept(token_exp: Duration, refresh_exp: Duration, tick: Duration) -> Self {
        let refresh_exp = Self::checked_refresh_exp(token_exp, refresh_exp);
        Self {
            access: TtlMap::unswept(token_exp, tick),
            refresh: TtlMap::unswept(refresh_exp, tick),
        }
    }

    fn checked_refresh_exp(token_exp: Duration, refresh_exp: Duration) -> Duration {
        if refresh_exp <= token_exp {
            warn!(
                ?token_exp,
                ?refresh_exp,
                "refresh TTL not longer than access TTL, stretching refresh TTL"
            );
            token_exp + token_exp
        } else {
            refresh_exp
        }
    }

    /// Register a record under both its access and refresh keys.
    pub fn save_token(&self, record: &TokenRecord) {
        self.access.put(record.token.clone(), None, record.clone());
        self.refresh
            .put(record.refresh_token.clone(), None, record.clone());
    }

    /// Look up a live record by access token.
    pub fn token_exist(&self, access_token: &str) -> Option<TokenRecord> {
        self.access.get(access_token)
    }

    /// Look up a live record by refresh token.
    pub fn refresh_token_exist(&self, refresh_token: &str) -> Option<TokenRecord> {
        self.refresh.get(refresh_token)
    }

    /// Drop an access entry.
    pub fn delete_access(&self, access_token: &str) -> bool {
        self.access.delete(access_token)
    }

    /// Drop a refresh entry.
    pub fn delete_refresh(&self, refresh_token: &str) -> bool {
        self.refresh.delete(refresh_token)
    }

    /// Drop both entries of a record.
    pub fn delete_record(&self, record: &TokenRecord) {
        self.access.delete(&record.token);
        self.refresh.delete(&record.refresh_token);
    }

    /// Access keys still referenced by any live record: entries of the
    /// access map plus the access key carried inside every live refresh
    /// record. A session's connection stays valid until its refresh window
    /// closes, so reclamation checks against this set.
    pub fn live_access_keys(&self) -> std::collections::HashSet<String> {
        let mut keys: std::collections::HashSet<String> =
            self.access.keys().into_iter().collect();
        for (_, record) in self.refresh.snapshot() {
            keys.insert(record.token);
        }
        keys
    }

    /// Live access tokens
    pub fn active_tokens(&self) -> usize {
        self.access.len()
    }

    /// Live refresh tokens
    pub fn active_refresh_tokens(&self) -> usize {
        self.refresh.len()
    }

    /// Force one sweep of both maps, returning entries removed.
    pub fn sweep_now(&self) -> usize {
        self.access.sweep_now() + self.refresh.sweep_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const TICK: Duration = Duration::from_secs(60);

    fn record(access: &str, refresh: &str) -> TokenRecord {
        let now = Utc::now();
        TokenRecord {
            user_id: "7".to_string(),
            username: "alice".to_string(),
            token: access.to_string(),
            refresh_token: refresh.to_string(),
            token_expires_at: now + chrono::Duration::hours(24),
            refresh_expires_at: now + chrono::Duration::hours(48),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_save_then_lookup_round_trip() {
        let store = TokenStore::unswept(
            Duration::from_secs(60),
            Duration::from_secs(120),
            TICK,
        );
        let rec = record("acc-1", "ref-1");
        store.save_token(&rec);

        assert_eq!(store.token_exist("acc-1"), Some(rec.clone()));
        assert_eq!(store.refresh_token_exist("ref-1"), Some(rec));
        assert_eq!(store.token_exist("ref-1"), None);
        assert_eq!(store.refresh_token_exist("acc-1"), None);
    }

    #[tokio::test]
    async fn test_access_expires_before_refresh() {
        let store = TokenStore::unswept(
            Duration::from_millis(1),
            Duration::from_secs(60),
            TICK,
        );
        let rec = record("acc-2", "ref-2");
        store.save_token(&rec);

        tokio::time::sleep(Duration::from_millis(10)).await;

        // Access key dead, refresh key still live: a refresh would succeed.
        assert!(store.token_exist("acc-2").is_none());
        assert!(store.refresh_token_exist("ref-2").is_some());
    }

    #[tokio::test]
    async fn test_delete_record_drops_both_keys() {
        let store = TokenStore::unswept(
            Duration::from_secs(60),
            Duration::from_secs(120),
            TICK,
        );
        let rec = record("acc-3", "ref-3");
        store.save_token(&rec);
        store.delete_record(&rec);

        assert!(store.token_exist("acc-3").is_none());
        assert!(store.refresh_token_exist("ref-3").is_none());
        assert_eq!(store.active_tokens(), 0);
        assert_eq!(store.active_refresh_tokens(), 0);
    }

    #[tokio::test]
    async fn test_ttl_inversion_is_corrected() {
        // refresh <= access would break the session lifecycle; the store
        // stretches the refresh TTL instead.
        let store = TokenStore::unswept(
            Duration::from_secs(60),
            Duration::from_secs(30),
            TICK,
        );
        let rec = record("acc-4", "ref-4");
        store.save_token(&rec);
        assert!(store.refresh_token_exist("ref-4").is_some());
    }

    #[test]
    fn test_token_record_wire_names() {
        let rec = record("a", "r");
        let json = serde_json::to_value(&rec).expect("serialize");
        assert!(json.get("token").is_some());
        assert!(json.get("refresh_token").is_some());
        assert!(json.get("token_expired_at").is_some());
        assert!(json.get("refresh_expired_at").is_some());
        assert!(json.get("created_at").is_some());
    }
}
