//! Bounded connection pool keyed by access token
//!
//! Each authenticated session owns exactly one driver, registered under its
//! access token. Admission is a check-then-insert under one write lock so
//! the capacity invariant holds at every observable moment. The pool never
//! destroys entries on its own timer: the cleanup supervisor cross-references
//! tokens and calls [`ConnectionPool::close`], which is also the only place
//! a pooled driver's disposal hook runs.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::driver::Driver;
use crate::error::{Error, Result};

struct PoolInner {
    entries: BTreeMap<String, Arc<dyn Driver>>,
    max_pool: usize,
    peer_count: usize,
    enabled: bool,
}

/// Token → leased driver map with bounded admission.
pub struct ConnectionPool {
    inner: RwLock<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool with the configured capacity.
    pub fn new(max_pool: usize, enabled: bool) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                entries: BTreeMap::new(),
                max_pool,
                peer_count: 0,
                enabled,
            }),
        }
    }

    /// Reapply capacity settings after a configuration reload.
    pub fn configure(&self, max_pool: usize, enabled: bool, peer_count: usize) {
        let mut inner = self.inner.write();
        inner.max_pool = max_pool;
        inner.enabled = enabled;
        inner.peer_count = peer_count;
    }

    /// Effective capacity: configured × peer-count when at least one peer
    /// is known.
    pub fn effective_max(&self) -> usize {
        let inner = self.inner.read();
        effective_max(inner.max_pool, inner.peer_count)
    }

    /// Whether pooled admission is in effect. A zero capacity behaves as
    /// disabled: sessions fall through to the internal driver.
    pub fn is_enabled(&self) -> bool {
        let inner = self.inner.read();
        inner.enabled && effective_max(inner.max_pool, inner.peer_count) > 0
    }

    /// Admit a driver under an access token.
    ///
    /// Fails with [`Error::PoolExhausted`] when the pool is full or pooling
    /// is off; the check and the insert happen under one lock.
    pub fn put(&self, access_token: impl Into<String>, driver: Arc<dyn Driver>) -> Result<()> {
        let mut inner = self.inner.write();
        let max = effective_max(inner.max_pool, inner.peer_count);
        if !inner.enabled || max == 0 {
            return Err(Error::pool_exhausted("connection pooling is disabled"));
        }
        if inner.entries.len() >= max {
            return Err(Error::pool_exhausted(format!(
                "pool quota exceeded ({max} connections)"
            )));
        }
        inner.entries.insert(access_token.into(), driver);
        Ok(())
    }

    /// Look up the driver leased to an access token.
    pub fn get(&self, access_token: &str) -> Option<Arc<dyn Driver>> {
        self.inner.read().entries.get(access_token).cloned()
    }

    /// Remove an entry and run its driver's disposal hook, best-effort.
    ///
    /// Returns `None` when no entry existed, otherwise the disposal result.
    pub async fn close(&self, access_token: &str) -> Option<Result<()>> {
        let driver = self.inner.write().entries.remove(access_token)?;
        let result = driver.close().await;
        if let Err(e) = &result {
            warn!(error = %e, "failed to close pooled connection");
        }
        Some(result)
    }

    /// Close every entry in sequence; returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(String, Arc<dyn Driver>)> = {
            let mut inner = self.inner.write();
            std::mem::take(&mut inner.entries).into_iter().collect()
        };
        let count = drained.len();
        for (token, driver) in drained {
            if let Err(e) = driver.close().await {
                warn!(error = %e, token = %token, "failed to close connection during shutdown");
            }
        }
        debug!(count, "closed all pooled connections");
        count
    }

    /// Current pool size.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the pool holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current key set.
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }

    /// Pool usage as a percentage of effective capacity.
    pub fn usage_pct(&self) -> f64 {
        let inner = self.inner.read();
        let max = effective_max(inner.max_pool, inner.peer_count);
        if max == 0 {
            0.0
        } else {
            inner.entries.len() as f64 / max as f64 * 100.0
        }
    }
}

fn effective_max(max_pool: usize, peer_count: usize) -> usize {
    if peer_count > 0 {
        max_pool * peer_count
    } else {
        max_pool
    }
}
