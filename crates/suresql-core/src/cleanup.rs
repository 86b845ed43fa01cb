//! Cleanup supervisor
//!
//! A pool entry and its token records reference each other only by key; this
//! supervisor breaks the cycle. Every sweep tick it snapshots the pool's key
//! set, asks the token store which access keys are still alive, and closes
//! every entry whose session has fully expired. The pool itself never
//! reclaims entries on its own timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::DEFAULT_SWEEP_INTERVAL;
use crate::node::Node;

/// Periodic reclamation of pool entries whose tokens have expired.
pub struct CleanupSupervisor {
    running: AtomicBool,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for CleanupSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupSupervisor {
    /// A stopped supervisor.
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Start the reclamation loop at the node's configured sweep interval,
    /// floored at the default. Calling again while running is a no-op.
    pub fn start(&self, node: Arc<Node>) {
        let interval = node.resolved().sweep_interval.max(DEFAULT_SWEEP_INTERVAL);
        self.start_with_interval(node, interval);
    }

    /// Start with an explicit period (tests shrink it).
    pub fn start_with_interval(&self, node: Arc<Node>, period: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = broadcast::channel(1);
        *self.shutdown.lock() = Some(tx);

        let handle = tokio::spawn(async move {
            info!(?period, "connection cleanup started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        sweep_once(&node).await;
                    }
                }
            }
            info!("connection cleanup stopped");
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
}

/// One reclamation pass: close every pool entry whose access key no longer
/// appears in any live token record. Returns how many entries were closed.
pub async fn sweep_once(node: &Node) -> usize {
    let live = node.tokens.live_access_keys();
    let mut closed = 0;
    for key in node.pool.keys() {
        if live.contains(&key) {
            continue;
        }
        if let Some(disposed) = node.pool.close(&key).await {
            closed += 1;
            node.metrics.record_token_expired();
            if disposed.is_ok() {
                node.metrics.record_connection_closed();
            }
        }
    }
    if closed > 0 {
        debug!(closed, "reclaimed expired connections");
    }
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbmsConfig;
    use crate::memory::MemoryDriver;
    use crate::token::TokenRecord;

    async fn test_node() -> Arc<Node> {
        Node::with_driver(Arc::new(MemoryDriver::new()), DbmsConfig::default())
            .await
            .expect("node")
    }

    fn record(access: &str, refresh: &str) -> TokenRecord {
        TokenRecord {
            token: access.to_string(),
            refresh_token: refresh.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sweep_closes_only_dead_entries() {
        let node = test_node().await;
        let live_driver = Arc::new(MemoryDriver::new());
        let dead_driver = Arc::new(MemoryDriver::new());

        node.tokens.save_token(&record("live-token", "live-refresh"));
        node.pool.put("live-token", live_driver.clone()).unwrap();
        node.pool.put("dead-token", dead_driver.clone()).unwrap();

        let closed = sweep_once(&node).await;
        assert_eq!(closed, 1);
        assert!(node.pool.get("live-token").is_some());
        assert!(node.pool.get("dead-token").is_none());
        assert!(dead_driver.is_closed());
        assert!(!live_driver.is_closed());

        let snap = node.metrics_snapshot();
        assert_eq!(snap.tokens_expired, 1);
        assert_eq!(snap.connections_closed, 1);
    }

    #[tokio::test]
    async fn test_entry_survives_on_refresh_liveness_alone() {
        // Access key expired from the access map, but the refresh record
        // still references it: the driver must stay.
        let node = test_node().await;
        let rec = record("acc", "ref");
        node.tokens.save_token(&rec);
        node.tokens.delete_access("acc");
        node.pool.put("acc", Arc::new(MemoryDriver::new())).unwrap();

        assert_eq!(sweep_once(&node).await, 0);
        assert!(node.pool.get("acc").is_some());

        // Once the refresh record goes too, the entry is reclaimed.
        node.tokens.delete_refresh("ref");
        assert_eq!(sweep_once(&node).await, 1);
        assert!(node.pool.get("acc").is_none());
    }

    #[tokio::test]
    async fn test_supervisor_loop_reclaims() {
        let node = test_node().await;
        node.pool
            .put("orphan", Arc::new(MemoryDriver::new()))
            .unwrap();

        let supervisor = CleanupSupervisor::new();
        supervisor.start_with_interval(Arc::clone(&node), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.stop().await;

        assert!(node.pool.is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let node = test_node().await;
        let supervisor = CleanupSupervisor::new();
        supervisor.start_with_interval(node, Duration::from_millis(10));
        supervisor.stop().await;
        supervisor.stop().await;
    }
}
