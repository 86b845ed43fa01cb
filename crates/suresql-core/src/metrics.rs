//! Runtime metrics for a SureSQL node
//!
//! Counters are lock-free atomics; the non-scalar fields (last pool
//! exhaustion, query-latency EMA) sit behind a short mutex. A snapshot
//! composes counter reads with one scalar-lock acquisition and recomputes
//! the derived gauges (active connections, pool usage, uptime) from values
//! the node supplies at read time.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Minimum samples before a failure rate is considered meaningful
const MIN_RATE_SAMPLES: u64 = 10;
/// EMA smoothing factor for query latency
const QUERY_TIME_ALPHA: f64 = 0.1;

#[derive(Debug, Default)]
struct ScalarMetrics {
    last_pool_exhaustion: Option<DateTime<Utc>>,
    last_pool_exhaustion_instant: Option<Instant>,
    average_query_time_ms: f64,
}

/// Monotonic counters plus guarded scalars for one node.
#[derive(Debug)]
pub struct NodeMetrics {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    pool_exhaustion_count: AtomicU64,
    tokens_created: AtomicU64,
    tokens_expired: AtomicU64,
    refresh_tokens_used: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    authentication_attempts: AtomicU64,
    authentication_failures: AtomicU64,
    queries_executed: AtomicU64,
    queries_success: AtomicU64,
    queries_failed: AtomicU64,
    scalars: Mutex<ScalarMetrics>,
    start_time: DateTime<Utc>,
    started: Instant,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    /// Create metrics anchored at now.
    pub fn new() -> Self {
        Self {
            connections_created: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            pool_exhaustion_count: AtomicU64::new(0),
            tokens_created: AtomicU64::new(0),
            tokens_expired: AtomicU64::new(0),
            refresh_tokens_used: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            authentication_attempts: AtomicU64::new(0),
            authentication_failures: AtomicU64::new(0),
            queries_executed: AtomicU64::new(0),
            queries_success: AtomicU64::new(0),
            queries_failed: AtomicU64::new(0),
            scalars: Mutex::new(ScalarMetrics::default()),
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Record a connection creation
    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pool admission failure
    pub fn record_pool_exhaustion(&self) {
        self.pool_exhaustion_count.fetch_add(1, Ordering::Relaxed);
        let mut scalars = self.scalars.lock();
        scalars.last_pool_exhaustion = Some(Utc::now());
        scalars.last_pool_exhaustion_instant = Some(Instant::now());
    }

    /// Record a token pair being minted
    pub fn record_token_created(&self) {
        self.tokens_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a token expiring
    pub fn record_token_expired(&self) {
        self.tokens_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refresh token being redeemed
    pub fn record_refresh_token_used(&self) {
        self.refresh_tokens_used.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an API request and whether it succeeded
    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an authentication attempt and its outcome
    pub fn record_authentication(&self, success: bool) {
        self.authentication_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.authentication_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a query, its outcome, and its duration; feeds the latency EMA.
    pub fn record_query(&self, success: bool, duration_ms: f64) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.queries_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.queries_failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut scalars = self.scalars.lock();
        if scalars.average_query_time_ms == 0.0 {
            scalars.average_query_time_ms = duration_ms;
        } else {
            scalars.average_query_time_ms = (1.0 - QUERY_TIME_ALPHA)
                * scalars.average_query_time_ms
                + QUERY_TIME_ALPHA * duration_ms;
        }
    }

    /// Pool exhaustion count so far
    pub fn pool_exhaustions(&self) -> u64 {
        self.pool_exhaustion_count.load(Ordering::Relaxed)
    }

    /// Time of the most recent pool exhaustion, monotonic
    pub fn last_pool_exhaustion_instant(&self) -> Option<Instant> {
        self.scalars.lock().last_pool_exhaustion_instant
    }

    /// Authentication attempt / failure counters
    pub fn auth_counts(&self) -> (u64, u64) {
        (
            self.authentication_attempts.load(Ordering::Relaxed),
            self.authentication_failures.load(Ordering::Relaxed),
        )
    }

    /// Query executed / failed counters
    pub fn query_counts(&self) -> (u64, u64) {
        (
            self.queries_executed.load(Ordering::Relaxed),
            self.queries_failed.load(Ordering::Relaxed),
        )
    }

    /// Server start time
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Seconds since start
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Compose a snapshot from counters plus gauges observed by the caller.
    pub fn snapshot(&self, gauges: GaugeInputs) -> MetricsSnapshot {
        let scalars = self.scalars.lock();
        let usage_pct = if gauges.pool_capacity > 0 {
            gauges.active_connections as f64 / gauges.pool_capacity as f64 * 100.0
        } else {
            0.0
        };
        MetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_active: gauges.active_connections,
            connection_pool_size: gauges.pool_capacity,
            connection_pool_usage_pct: usage_pct,
            pool_exhaustion_count: self.pool_exhaustion_count.load(Ordering::Relaxed),
            last_pool_exhaustion: scalars.last_pool_exhaustion,
            tokens_active: gauges.tokens_active,
            tokens_created: self.tokens_created.load(Ordering::Relaxed),
            tokens_expired: self.tokens_expired.load(Ordering::Relaxed),
            refresh_tokens_active: gauges.refresh_tokens_active,
            refresh_tokens_used: self.refresh_tokens_used.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            authentication_attempts: self.authentication_attempts.load(Ordering::Relaxed),
            authentication_failures: self.authentication_failures.load(Ordering::Relaxed),
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            queries_success: self.queries_success.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            average_query_time_ms: scalars.average_query_time_ms,
            start_time: self.start_time,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    /// Score node health from the current counters and observed gauges.
    ///
    /// Rates only count once they have at least ten samples.
    pub fn health(&self, pool_usage_pct: f64, driver_connected: bool) -> HealthReport {
        let mut status = HealthStatus::Healthy;
        let mut issues = Vec::new();

        if pool_usage_pct >= 90.0 {
            status = HealthStatus::Degraded;
            issues.push("connection pool near capacity".to_string());
        }

        let (attempts, failures) = self.auth_counts();
        if attempts >= MIN_RATE_SAMPLES {
            let rate = failures as f64 / attempts as f64 * 100.0;
            if rate > 50.0 {
                status = HealthStatus::Degraded;
                issues.push("high authentication failure rate".to_string());
            }
        }

        let (queries, query_failures) = self.query_counts();
        if queries >= MIN_RATE_SAMPLES {
            let rate = query_failures as f64 / queries as f64 * 100.0;
            if rate > 10.0 {
                status = HealthStatus::Unhealthy;
                issues.push("high query failure rate".to_string());
            }
        }

        if !driver_connected {
            status = HealthStatus::Unhealthy;
            issues.push("database not connected".to_string());
        }

        HealthReport {
            status,
            issues,
            uptime_secs: self.uptime_secs(),
            start_time: self.start_time,
        }
    }
}

/// Gauges the caller observes at snapshot time
#[derive(Debug, Clone, Copy, Default)]
pub struct GaugeInputs {
    /// Current pool size
    pub active_connections: usize,
    /// Effective pool capacity
    pub pool_capacity: usize,
    /// Live access tokens
    pub tokens_active: usize,
    /// Live refresh tokens
    pub refresh_tokens_active: usize,
}

/// A point-in-time copy of every metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total connections created
    pub connections_created: u64,
    /// Total connections closed
    pub connections_closed: u64,
    /// Current active connections
    pub connections_active: usize,
    /// Effective pool capacity
    pub connection_pool_size: usize,
    /// Pool usage percentage
    pub connection_pool_usage_pct: f64,
    /// Times the pool refused admission
    pub pool_exhaustion_count: u64,
    /// Last admission refusal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pool_exhaustion: Option<DateTime<Utc>>,
    /// Live access tokens
    pub tokens_active: usize,
    /// Total token pairs minted
    pub tokens_created: u64,
    /// Total tokens expired
    pub tokens_expired: u64,
    /// Live refresh tokens
    pub refresh_tokens_active: usize,
    /// Total refresh tokens redeemed
    pub refresh_tokens_used: u64,
    /// Total API requests
    pub total_requests: u64,
    /// Failed API requests
    pub failed_requests: u64,
    /// Total authentication attempts
    pub authentication_attempts: u64,
    /// Failed authentication attempts
    pub authentication_failures: u64,
    /// Total queries dispatched
    pub queries_executed: u64,
    /// Successful queries
    pub queries_success: u64,
    /// Failed queries
    pub queries_failed: u64,
    /// Exponentially weighted average query latency, milliseconds
    pub average_query_time_ms: f64,
    /// Server start time
    pub start_time: DateTime<Utc>,
    /// Seconds since start
    pub uptime_secs: u64,
}

/// Overall node health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All signals nominal
    Healthy,
    /// Elevated pool usage or auth failures
    Degraded,
    /// Query failures or lost engine connection
    Unhealthy,
}

/// Health score plus the signals behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Human-readable contributing issues
    pub issues: Vec<String>,
    /// Seconds since start
    pub uptime_secs: u64,
    /// Server start time
    pub start_time: DateTime<Utc>,
}
