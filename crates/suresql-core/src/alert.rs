//! Alert engine
//!
//! A supervised loop evaluates the alert rules every 30 seconds, in order:
//! pool usage, recent pool exhaustion, authentication failure rate, query
//! failure rate. Each rule-and-band has an independent five-minute cooldown
//! so a persistent condition fires once per window instead of every tick.
//! Fired alerts land in a bounded ring of the last 100.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::node::Node;

/// Evaluation period
pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Per-rule re-fire suppression window
pub const ALERT_COOLDOWN: Duration = Duration::from_secs(5 * 60);
/// Bounded history length
pub const MAX_ALERT_HISTORY: usize = 100;
/// Pool usage percentage that warns
pub const POOL_WARNING_THRESHOLD: f64 = 75.0;
/// Pool usage percentage that is critical
pub const POOL_CRITICAL_THRESHOLD: f64 = 90.0;
/// Window in which a past exhaustion still counts as recent
const RECENT_EXHAUSTION_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Minimum samples before a failure rate is evaluated
const MIN_RATE_SAMPLES: u64 = 10;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    /// Informational
    Info,
    /// Needs attention
    Warning,
    /// Needs action now
    Critical,
}

/// One fired alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Severity
    pub level: AlertLevel,
    /// Short title
    pub title: String,
    /// Full message
    pub message: String,
    /// Fire time
    pub timestamp: DateTime<Utc>,
    /// Rule-specific context
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Rule + band identity for cooldown bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Rule {
    PoolWarning,
    PoolCritical,
    PoolExhaustion,
    AuthFailureRate,
    QueryFailureWarning,
    QueryFailureCritical,
}

/// The signals one evaluation pass reads
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertObservation {
    /// Current pool size
    pub pool_active: usize,
    /// Effective pool capacity
    pub pool_max: usize,
    /// Admission refusals so far
    pub exhaustion_count: u64,
    /// When the pool last refused admission
    pub last_exhaustion: Option<Instant>,
    /// Authentication attempts so far
    pub auth_attempts: u64,
    /// Authentication failures so far
    pub auth_failures: u64,
    /// Queries dispatched so far
    pub queries_executed: u64,
    /// Queries failed so far
    pub queries_failed: u64,
}

impl AlertObservation {
    /// Read the signals from a node.
    pub fn from_node(node: &Node) -> Self {
        let (auth_attempts, auth_failures) = node.metrics.auth_counts();
        let (queries_executed, queries_failed) = node.metrics.query_counts();
        Self {
            pool_active: node.pool.len(),
            pool_max: node.pool.effective_max(),
            exhaustion_count: node.metrics.pool_exhaustions(),
            last_exhaustion: node.metrics.last_pool_exhaustion_instant(),
            auth_attempts,
            auth_failures,
            queries_executed,
            queries_failed,
        }
    }
}

/// Alert statistics exposed on the monitoring surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStats {
    /// Alerts currently held in the ring
    pub total_alerts: usize,
    /// Info alerts in the ring
    pub info: usize,
    /// Warning alerts in the ring
    pub warning: usize,
    /// Critical alerts in the ring
    pub critical: usize,
    /// Pool warning threshold, percent
    pub pool_warning_threshold: f64,
    /// Pool critical threshold, percent
    pub pool_critical_threshold: f64,
}

/// Rule evaluation, cooldown suppression, and bounded alert history.
pub struct AlertEngine {
    history: Mutex<VecDeque<Alert>>,
    cooldowns: Mutex<HashMap<Rule, Instant>>,
    thresholds: Mutex<(f64, f64)>,
    cooldown: Duration,
    running: AtomicBool,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertEngine {
    /// Engine with default thresholds and cooldown.
    pub fn new() -> Self {
        Self::with_cooldown(ALERT_COOLDOWN)
    }

    /// Engine with a custom cooldown (tests shrink it).
    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(MAX_ALERT_HISTORY)),
            cooldowns: Mutex::new(HashMap::new()),
            thresholds: Mutex::new((POOL_WARNING_THRESHOLD, POOL_CRITICAL_THRESHOLD)),
            cooldown,
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Start the evaluation loop. Calling again while running is a no-op.
    pub fn start(self: &Arc<Self>, node: Arc<Node>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = broadcast::channel(1);
        *self.shutdown.lock() = Some(tx);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("alert monitoring started");
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        engine.evaluate(AlertObservation::from_node(&node));
                    }
                }
            }
            info!("alert monitoring stopped");
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop the loop and wait for it to drain. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Run the rules, in order, against one observation.
    pub fn evaluate(&self, obs: AlertObservation) {
        self.check_pool_usage(&obs);
        self.check_pool_exhaustion(&obs);
        self.check_auth_failures(&obs);
        self.check_query_failures(&obs);
    }

    fn check_pool_usage(&self, obs: &AlertObservation) {
        if obs.pool_max == 0 {
            return;
        }
        let usage = obs.pool_active as f64 / obs.pool_max as f64 * 100.0;
        let (warning, critical) = *self.thresholds.lock();
        let metadata = json!({
            "active_connections": obs.pool_active,
            "max_pool": obs.pool_max,
            "usage_percentage": usage,
        });

        if usage >= critical {
            self.fire(
                Rule::PoolCritical,
                AlertLevel::Critical,
                "Connection Pool Critical",
                format!(
                    "Connection pool at {usage:.1}% capacity ({}/{}). Immediate action required!",
                    obs.pool_active, obs.pool_max
                ),
                metadata,
            );
        } else if usage >= warning {
            self.fire(
                Rule::PoolWarning,
                AlertLevel::Warning,
                "Connection Pool High Usage",
                format!(
                    "Connection pool at {usage:.1}% capacity ({}/{}). \
                     Consider scaling or investigating connection leaks.",
                    obs.pool_active, obs.pool_max
                ),
                metadata,
            );
        }
    }

    fn check_pool_exhaustion(&self, obs: &AlertObservation) {
        let recent = obs
            .last_exhaustion
            .is_some_and(|at| at.elapsed() < RECENT_EXHAUSTION_WINDOW);
        if obs.exhaustion_count > 0 && recent {
            self.fire(
                Rule::PoolExhaustion,
                AlertLevel::Critical,
                "Connection Pool Exhaustion",
                format!(
                    "Connection pool has been exhausted {} times recently.",
                    obs.exhaustion_count
                ),
                json!({ "exhaustion_count": obs.exhaustion_count }),
            );
        }
    }

    fn check_auth_failures(&self, obs: &AlertObservation) {
        if obs.auth_attempts < MIN_RATE_SAMPLES {
            return;
        }
        let rate = obs.auth_failures as f64 / obs.auth_attempts as f64 * 100.0;
        if rate > 50.0 {
            self.fire(
                Rule::AuthFailureRate,
                AlertLevel::Warning,
                "High Authentication Failure Rate",
                format!(
                    "Authentication failure rate at {rate:.1}% ({} failures / {} attempts). \
                     Possible brute force attack?",
                    obs.auth_failures, obs.auth_attempts
                ),
                json!({
                    "failure_rate": rate,
                    "failures": obs.auth_failures,
                    "attempts": obs.auth_attempts,
                }),
            );
        }
    }

    fn check_query_failures(&self, obs: &AlertObservation) {
        if obs.queries_executed < MIN_RATE_SAMPLES {
            return;
        }
        let rate = obs.queries_failed as f64 / obs.queries_executed as f64 * 100.0;
        let metadata = json!({
            "failure_rate": rate,
            "failures": obs.queries_failed,
            "total": obs.queries_executed,
        });
        if rate > 25.0 {
            self.fire(
                Rule::QueryFailureCritical,
                AlertLevel::Critical,
                "High Query Failure Rate",
                format!(
                    "Query failure rate at {rate:.1}% ({} failures / {} queries). \
                     Database issues detected!",
                    obs.queries_failed, obs.queries_executed
                ),
                metadata,
            );
        } else if rate > 10.0 {
            self.fire(
                Rule::QueryFailureWarning,
                AlertLevel::Warning,
                "Elevated Query Failure Rate",
                format!(
                    "Query failure rate at {rate:.1}% ({} failures / {} queries). \
                     Investigate database performance.",
                    obs.queries_failed, obs.queries_executed
                ),
                metadata,
            );
        }
    }

    fn fire(
        &self,
        rule: Rule,
        level: AlertLevel,
        title: &str,
        message: String,
        metadata: serde_json::Value,
    ) {
        {
            let mut cooldowns = self.cooldowns.lock();
            if let Some(last) = cooldowns.get(&rule) {
                if last.elapsed() < self.cooldown {
                    return;
                }
            }
            cooldowns.insert(rule, Instant::now());
        }
        self.create_alert(level, title, message, metadata);
    }

    /// Append an alert to the ring and log it. Bypasses cooldowns; the rule
    /// paths go through their own suppression first.
    pub fn create_alert(
        &self,
        level: AlertLevel,
        title: &str,
        message: String,
        metadata: serde_json::Value,
    ) {
        let alert = Alert {
            level,
            title: title.to_string(),
            message: message.clone(),
            timestamp: Utc::now(),
            metadata: match metadata {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
        };

        let mut history = self.history.lock();
        if history.len() == MAX_ALERT_HISTORY {
            history.pop_front();
        }
        history.push_back(alert);
        drop(history);

        match level {
            AlertLevel::Critical => error!(title, "{message}"),
            AlertLevel::Warning => warn!(title, "{message}"),
            AlertLevel::Info => info!(title, "{message}"),
        }
    }

    /// The most recent alerts, newest last. A limit of 0 returns everything.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.lock();
        let limit = if limit == 0 || limit > history.len() {
            history.len()
        } else {
            limit
        };
        history.iter().skip(history.len() - limit).cloned().collect()
    }

    /// All held alerts of one severity.
    pub fn by_level(&self, level: AlertLevel) -> Vec<Alert> {
        self.history
            .lock()
            .iter()
            .filter(|a| a.level == level)
            .cloned()
            .collect()
    }

    /// Counts and thresholds.
    pub fn stats(&self) -> AlertStats {
        let history = self.history.lock();
        let (warning_threshold, critical_threshold) = *self.thresholds.lock();
        let mut info = 0;
        let mut warning = 0;
        let mut critical = 0;
        for alert in history.iter() {
            match alert.level {
                AlertLevel::Info => info += 1,
                AlertLevel::Warning => warning += 1,
                AlertLevel::Critical => critical += 1,
            }
        }
        AlertStats {
            total_alerts: history.len(),
            info,
            warning,
            critical,
            pool_warning_threshold: warning_threshold,
            pool_critical_threshold: critical_threshold,
        }
    }

    /// Drop every held alert.
    pub fn clear(&self) {
        self.history.lock().clear();
    }

    /// Override the pool usage thresholds.
    pub fn set_thresholds(&self, warning: f64, critical: f64) {
        *self.thresholds.lock() = (warning, critical);
    }
}
