//! Ordered key→value store with per-entry expiry
//!
//! The node keeps its token records and per-session connections in these
//! maps. Entries carry an absolute deadline; readers never observe an entry
//! past its deadline, and a background sweeper physically removes expired
//! entries every tick. The map never runs disposal side effects on values;
//! closing a pooled connection is the pool layer's job, so removal by sweep
//! and removal by an explicit `delete` look identical to callers.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Inner<V> {
    entries: RwLock<BTreeMap<String, Entry<V>>>,
    default_ttl: Duration,
    tick: Duration,
}

/// A concurrent map whose entries expire after a per-entry TTL.
///
/// Cloning is cheap and shares the underlying store. The background sweeper
/// holds only a weak reference, so dropping the last clone stops it.
pub struct TtlMap<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TtlMap<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TtlMap<V> {
    /// Create a map with the given default TTL and sweep tick, and start
    /// the background sweeper.
    pub fn new(default_ttl: Duration, tick: Duration) -> Self {
        let map = Self::unswept(default_ttl, tick);
        map.spawn_sweeper();
        map
    }

    /// Create a map without a background sweeper (tests drive expiry
    /// explicitly via [`TtlMap::sweep_now`]).
    pub fn unswept(default_ttl: Duration, tick: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(BTreeMap::new()),
                default_ttl,
                tick,
            }),
        }
    }

    fn spawn_sweeper(&self) {
        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        let tick = self.inner.tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = Self::sweep(&inner);
                if removed > 0 {
                    debug!(removed, "ttl sweep removed expired entries");
                }
            }
        });
    }

    fn sweep(inner: &Inner<V>) -> usize {
        let now = Instant::now();
        let mut entries = inner.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// Insert `value` under `key`. `ttl` of `None` uses the map default.
    /// Replaces any existing entry, resetting its deadline.
    pub fn put(&self, key: impl Into<String>, ttl: Option<Duration>, value: V) {
        let ttl = ttl.unwrap_or(self.inner.default_ttl);
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.entries.write().insert(key.into(), entry);
    }

    /// Look up a live entry. Expired entries are invisible even before the
    /// sweeper has removed them.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.inner.entries.read();
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    /// Remove an entry. Returns true if a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .entries
            .write()
            .remove(key)
            .is_some_and(|e| e.expires_at > now)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .read()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Whether the map holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of all live entries, in key order.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        let now = Instant::now();
        self.inner
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Keys of all live entries, in order.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Run one sweep pass immediately, returning the number of entries
    /// removed.
    pub fn sweep_now(&self) -> usize {
        Self::sweep(&self.inner)
    }

    /// The map's default TTL.
    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }
}
