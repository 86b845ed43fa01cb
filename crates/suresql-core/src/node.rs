//! Per-process node state
//!
//! One [`Node`] fronts one backing engine: it owns the internal driver, the
//! token store, the bounded connection pool, and the metrics. Configuration,
//! settings and the status snapshot sit behind a single reader/writer lock;
//! accessors hand out copies and mutators run closures under the write lock.
//! Handlers receive the node as an explicit `Arc<Node>`; there is no
//! process-wide global.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::config::{
    self, apply_env_overrides, dbms_config_from_env, load_config_row, load_settings, resolve,
    ConfigRow, DbmsConfig, ResolvedConfig, Settings, LEADER_NODE_NUMBER,
};
use crate::driver::{Driver, NodeStatus};
use crate::error::{Error, Result};
use crate::factory::open_database;
use crate::metrics::{GaugeInputs, HealthReport, MetricsSnapshot, NodeMetrics};
use crate::pool::ConnectionPool;
use crate::schema::init_db;
use crate::token::TokenStore;

/// Service name
pub const APP_NAME: &str = "SureSQL";
/// Service version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Liveness banner
pub fn ping() -> String {
    format!("{APP_NAME} {APP_VERSION} is running")
}

/// Future returned by a [`SessionDriverFactory`]
pub type SessionDriverFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<dyn Driver>>> + Send>>;

/// Opens one driver per authenticated session. The default factory dials
/// the configured engine; embedded and test setups substitute their own.
pub type SessionDriverFactory = Arc<dyn Fn() -> SessionDriverFuture + Send + Sync>;

struct NodeState {
    config: ConfigRow,
    settings: Settings,
    resolved: ResolvedConfig,
    status: NodeStatus,
}

/// The runtime of a single gateway node.
pub struct Node {
    state: RwLock<NodeState>,
    internal: Arc<dyn Driver>,
    internal_config: DbmsConfig,
    /// Session token records, access + refresh maps
    pub tokens: TokenStore,
    /// Token → leased driver
    pub pool: ConnectionPool,
    /// Runtime counters and health scoring
    pub metrics: Arc<NodeMetrics>,
    session_factory: RwLock<SessionDriverFactory>,
    start_time: DateTime<Utc>,
    started: Instant,
}

impl Node {
    /// Connect to the configured engine and assemble the node.
    ///
    /// Reads the `DBMS_*` environment, opens the internal connection,
    /// bootstraps the store on first boot, then loads and resolves
    /// configuration.
    pub async fn connect() -> Result<Arc<Self>> {
        let dbms = dbms_config_from_env();
        info!(config = ?dbms, "making internal connection");
        let driver = open_database(&dbms).await?;
        Self::with_driver(driver, dbms).await
    }

    /// Assemble a node around an already-open internal driver.
    pub async fn with_driver(internal: Arc<dyn Driver>, mut dbms: DbmsConfig) -> Result<Arc<Self>> {
        // SURESQL_INTERNAL_API=user:pass overrides the credentials guarding
        // the internal and monitoring surfaces.
        if let Ok(api) = std::env::var("SURESQL_INTERNAL_API") {
            if let Some((user, pass)) = api.split_once(':') {
                dbms.username = user.to_string();
                dbms.password = pass.to_string();
            }
        }

        // First boot: the config row is the initialization marker.
        let mut config = match load_config_row(internal.as_ref()).await {
            Ok(config) => config,
            Err(_) => {
                info!("store not initialized, applying bootstrap bundle");
                init_db(internal.as_ref(), &ConfigRow::default()).await?;
                load_config_row(internal.as_ref()).await?
            }
        };

        let settings = load_settings(internal.as_ref()).await?;
        let mut resolved = resolve(&config, &settings);
        apply_env_overrides(&mut config, &mut resolved);

        let tokens = TokenStore::new(
            resolved.token_exp,
            resolved.refresh_exp,
            resolved.sweep_interval,
        );
        let pool = ConnectionPool::new(resolved.max_pool, resolved.pool_enabled);
        pool.configure(
            resolved.max_pool,
            resolved.pool_enabled,
            resolved.peers.len(),
        );

        let start_time = Utc::now();
        let status = build_status(&config, &resolved, pool.effective_max(), start_time);

        let factory_config = dbms.clone();
        let session_factory: SessionDriverFactory = Arc::new(move || {
            let config = factory_config.clone();
            Box::pin(async move { open_database(&config).await })
        });

        let node = Arc::new(Self {
            state: RwLock::new(NodeState {
                config,
                settings,
                resolved,
                status,
            }),
            internal,
            internal_config: dbms,
            tokens,
            pool,
            metrics: Arc::new(NodeMetrics::new()),
            session_factory: RwLock::new(session_factory),
            start_time,
            started: Instant::now(),
        });

        node.refresh_status_from_driver().await;
        Ok(node)
    }

    /// Copy of the persisted configuration row (with env overrides applied).
    pub fn config(&self) -> ConfigRow {
        self.state.read().config.clone()
    }

    /// Copy of the loaded settings rows.
    pub fn settings(&self) -> Settings {
        self.state.read().settings.clone()
    }

    /// Copy of the effective runtime values.
    pub fn resolved(&self) -> ResolvedConfig {
        self.state.read().resolved.clone()
    }

    /// API key and client id clients must present.
    pub fn api_credentials(&self) -> (String, String) {
        let state = self.state.read();
        (
            state.config.env.api_key.clone(),
            state.config.env.client_id.clone(),
        )
    }

    /// Credentials guarding the internal and monitoring surfaces.
    pub fn internal_credentials(&self) -> (String, String) {
        (
            self.internal_config.username.clone(),
            self.internal_config.password.clone(),
        )
    }

    /// The node's own engine connection.
    pub fn internal_driver(&self) -> Arc<dyn Driver> {
        Arc::clone(&self.internal)
    }

    /// Driver configuration used to open per-session connections.
    pub fn internal_config(&self) -> DbmsConfig {
        self.internal_config.clone()
    }

    /// Open a fresh driver for one session.
    pub async fn open_session_driver(&self) -> Result<Arc<dyn Driver>> {
        let factory = Arc::clone(&*self.session_factory.read());
        factory().await
    }

    /// Replace the session driver factory (embedded/test setups).
    pub fn set_session_factory(&self, factory: SessionDriverFactory) {
        *self.session_factory.write() = factory;
    }

    /// Run a mutation under the exclusive state lock.
    pub fn with_state_mut<T>(&self, f: impl FnOnce(&mut ConfigRow, &mut Settings) -> T) -> T {
        let mut state = self.state.write();
        let state = &mut *state;
        f(&mut state.config, &mut state.settings)
    }

    /// Status snapshot with the uptime refreshed at read time.
    pub fn status(&self) -> NodeStatus {
        let mut status = self.state.read().status.clone();
        status.uptime_secs = self.started.elapsed().as_secs();
        status
    }

    /// Merge the engine's own status report into the snapshot.
    pub async fn refresh_status_from_driver(&self) {
        match self.internal.status().await {
            Ok(engine) => {
                let mut state = self.state.write();
                state.status.dbms_driver = engine.dbms_driver;
                state.status.leader = engine.leader;
                state.status.dir_size = engine.dir_size;
                state.status.db_size = engine.db_size;
                state.status.last_backup = engine.last_backup;
            }
            Err(e) => error!(error = %e, "cannot read engine status"),
        }
    }

    /// The driver serving a presented access token.
    ///
    /// With pooling enabled the token must own a pool entry; with pooling
    /// disabled every session shares the internal driver.
    pub fn connection_for_token(&self, access_token: &str) -> Result<Arc<dyn Driver>> {
        if self.pool.is_enabled() {
            self.pool.get(access_token).ok_or(Error::NoConnection)
        } else {
            Ok(Arc::clone(&self.internal))
        }
    }

    /// Re-read the config row and settings from the store, re-resolve, and
    /// reapply pool capacity. The administrative reload is the only path
    /// that mutates configuration at runtime.
    pub async fn reload(&self) -> Result<()> {
        let mut config = load_config_row(self.internal.as_ref()).await?;
        let settings = load_settings(self.internal.as_ref()).await?;
        let mut resolved = resolve(&config, &settings);
        apply_env_overrides(&mut config, &mut resolved);
        config::reload_dbms_config();

        self.pool.configure(
            resolved.max_pool,
            resolved.pool_enabled,
            resolved.peers.len(),
        );

        let mut state = self.state.write();
        state.status = build_status(
            &config,
            &resolved,
            self.pool.effective_max(),
            self.start_time,
        );
        state.config = config;
        state.settings = settings;
        state.resolved = resolved;
        info!("configuration reloaded");
        Ok(())
    }

    /// Gauges observed right now, for metric snapshots.
    pub fn gauges(&self) -> GaugeInputs {
        GaugeInputs {
            active_connections: self.pool.len(),
            pool_capacity: self.pool.effective_max(),
            tokens_active: self.tokens.active_tokens(),
            refresh_tokens_active: self.tokens.active_refresh_tokens(),
        }
    }

    /// Full metrics snapshot.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.gauges())
    }

    /// Health report, consulting the internal driver's connectivity.
    pub async fn health(&self) -> HealthReport {
        let connected = self.internal.is_connected().await;
        self.metrics.health(self.pool.usage_pct(), connected)
    }

    /// Close every pooled connection and the internal driver.
    pub async fn shutdown(&self) {
        let closed = self.pool.close_all().await;
        for _ in 0..closed {
            self.metrics.record_connection_closed();
        }
        if let Err(e) = self.internal.close().await {
            error!(error = %e, "failed to close internal connection");
        }
        info!(closed, "node shut down");
    }
}

fn build_status(
    config: &ConfigRow,
    resolved: &ResolvedConfig,
    effective_max: usize,
    start_time: DateTime<Utc>,
) -> NodeStatus {
    NodeStatus {
        version: APP_VERSION.to_string(),
        is_leader: config.node_number == LEADER_NODE_NUMBER,
        url: config.facing_url(),
        mode: config.mode.clone(),
        nodes: config.nodes,
        node_number: config.node_number,
        node_id: config.node_number.to_string(),
        dbms: config.dbms.clone(),
        max_pool: effective_max as i64,
        start_time: Some(start_time),
        peers: resolved.peers.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Record;
    use crate::memory::MemoryDriver;
    use crate::schema::{CONFIG_TABLE, SETTINGS_TABLE};

    async fn node_with(driver: MemoryDriver) -> Arc<Node> {
        Node::with_driver(Arc::new(driver), DbmsConfig::default())
            .await
            .expect("node")
    }

    #[tokio::test]
    async fn test_bootstraps_empty_store() {
        let node = node_with(MemoryDriver::new()).await;
        let config = node.config();
        assert!(config.is_init_done);
        let status = node.status();
        assert_eq!(status.version, APP_VERSION);
    }

    #[tokio::test]
    async fn test_leader_flag_follows_node_number() {
        let driver = MemoryDriver::new().with_table(
            CONFIG_TABLE,
            vec![Record::new(CONFIG_TABLE)
                .with("label", "leader")
                .with("node_number", 1)
                .with("is_init_done", true)],
        );
        let node = node_with(driver).await;
        assert!(node.status().is_leader);

        let driver = MemoryDriver::new().with_table(
            CONFIG_TABLE,
            vec![Record::new(CONFIG_TABLE)
                .with("label", "follower")
                .with("node_number", 2)
                .with("is_init_done", true)],
        );
        let node = node_with(driver).await;
        assert!(!node.status().is_leader);
    }

    #[tokio::test]
    async fn test_connection_for_token_with_pool_disabled() {
        let driver = MemoryDriver::new().with_table(
            SETTINGS_TABLE,
            vec![Record::new(SETTINGS_TABLE)
                .with("category", "connection")
                .with("data_type", "int")
                .with("setting_key", "pool_on")
                .with("int_value", 0)],
        );
        let node = node_with(driver).await;
        assert!(!node.pool.is_enabled());

        // Any token resolves to the internal driver.
        let db = node.connection_for_token("whatever").expect("internal");
        assert!(db.is_connected().await);
    }

    #[tokio::test]
    async fn test_connection_for_token_requires_pool_entry() {
        let node = node_with(MemoryDriver::new()).await;
        assert!(node.pool.is_enabled());
        let err = node.connection_for_token("missing").unwrap_err();
        assert!(matches!(err, Error::NoConnection));

        node.pool
            .put("tok", Arc::new(MemoryDriver::new()))
            .expect("admit");
        assert!(node.connection_for_token("tok").is_ok());
    }

    #[tokio::test]
    async fn test_peer_scaling_applied_to_pool() {
        let driver = MemoryDriver::new().with_table(
            SETTINGS_TABLE,
            vec![
                Record::new(SETTINGS_TABLE)
                    .with("category", "connection")
                    .with("data_type", "int")
                    .with("setting_key", "max_pool")
                    .with("int_value", 3),
                Record::new(SETTINGS_TABLE)
                    .with("category", "nodes")
                    .with("data_type", "text")
                    .with("setting_key", "node_2")
                    .with("text_value", "2|http://b:4001|10.0.0.2|r"),
                Record::new(SETTINGS_TABLE)
                    .with("category", "nodes")
                    .with("data_type", "text")
                    .with("setting_key", "node_3")
                    .with("text_value", "3|http://c:4001|10.0.0.3|r"),
            ],
        );
        let node = node_with(driver).await;
        assert_eq!(node.pool.effective_max(), 6);
        assert_eq!(node.status().max_pool, 6);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let node = node_with(MemoryDriver::new()).await;
        let session = Arc::new(MemoryDriver::new());
        node.pool.put("tok", session.clone()).expect("admit");

        node.shutdown().await;
        assert!(node.pool.is_empty());
        assert!(session.is_closed());
        assert_eq!(node.metrics_snapshot().connections_closed, 1);
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_settings() {
        let driver = MemoryDriver::new();
        let node = Node::with_driver(Arc::new(driver), DbmsConfig::default())
            .await
            .expect("node");

        node.internal_driver()
            .insert_one_record(
                &Record::new(SETTINGS_TABLE)
                    .with("category", "connection")
                    .with("data_type", "int")
                    .with("setting_key", "max_pool")
                    .with("int_value", 2),
                false,
            )
            .await
            .expect("insert setting");

        node.reload().await.expect("reload");
        assert_eq!(node.pool.effective_max(), 2);
    }
}
