//! Persisted layout and first-boot bootstrap
//!
//! The node creates its internal tables once, as an ordered DDL bundle:
//! `_users` (credentials), `_tokens` (historical, the runtime keeps tokens
//! in memory), `_configs` (exactly one row), `_settings` (many rows, unique
//! per category + key). Re-running the bootstrap against an initialized
//! store is detected and is not an error.

use tracing::info;

use crate::config::ConfigRow;
use crate::driver::{Driver, Record};
use crate::error::{Error, Result};

/// Credential table
pub const USERS_TABLE: &str = "_users";
/// Token table, retained for compatibility; the runtime uses in-memory stores
pub const TOKENS_TABLE: &str = "_tokens";
/// Configuration table, exactly one row
pub const CONFIG_TABLE: &str = "_configs";
/// Settings table, unique on (category, setting_key)
pub const SETTINGS_TABLE: &str = "_settings";

/// Ordered DDL applied at first boot
pub const BOOTSTRAP_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS _users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL,
        role_name TEXT,
        created_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS _tokens (
        id TEXT PRIMARY KEY,
        user_id TEXT,
        token TEXT,
        refresh_token TEXT,
        token_expired_at TEXT,
        refresh_expired_at TEXT,
        created_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS _configs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        label TEXT,
        ip TEXT,
        host TEXT,
        port TEXT,
        ssl INTEGER DEFAULT 0,
        dbms TEXT,
        mode TEXT,
        nodes INTEGER DEFAULT 1,
        node_number INTEGER DEFAULT 1,
        node_id INTEGER DEFAULT 0,
        is_init_done INTEGER DEFAULT 0,
        is_split_write INTEGER DEFAULT 0,
        encryption_method TEXT,
        token_exp INTEGER DEFAULT 0,
        refresh_exp INTEGER DEFAULT 0,
        ttl_ticker INTEGER DEFAULT 0,
        token TEXT,
        refresh_token TEXT,
        jwe_key TEXT,
        jwt_key TEXT,
        api_key TEXT,
        client_id TEXT,
        http_timeout INTEGER DEFAULT 0,
        retry_timeout INTEGER DEFAULT 0,
        max_retries INTEGER DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS _settings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        category TEXT NOT NULL,
        data_type TEXT,
        setting_key TEXT NOT NULL,
        text_value TEXT,
        int_value INTEGER DEFAULT 0,
        float_value REAL DEFAULT 0,
        UNIQUE(category, setting_key)
    )",
];

/// Whether the store already carries a config row.
pub async fn is_initialized(db: &dyn Driver) -> bool {
    db.select_one(CONFIG_TABLE).await.is_ok()
}

/// Apply the DDL bundle and seed the config row.
///
/// Returns `Ok(true)` when the store was initialized by this call and
/// `Ok(false)` when it already was.
pub async fn init_db(db: &dyn Driver, config: &ConfigRow) -> Result<bool> {
    if is_initialized(db).await {
        info!("store already initialized, skipping bootstrap");
        return Ok(false);
    }

    let ddl: Vec<String> = BOOTSTRAP_DDL.iter().map(|s| s.to_string()).collect();
    db.exec_many_sql(&ddl).await?;

    let mut seeded = config.clone();
    seeded.is_init_done = true;
    db.insert_one_record(&config_record(&seeded)?, false).await?;
    info!("store initialized");
    Ok(true)
}

/// Render a config row as an insertable record, letting the store assign
/// the row id.
pub fn config_record(config: &ConfigRow) -> Result<Record> {
    let value = serde_json::to_value(config)
        .map_err(|e| Error::internal(format!("cannot serialize config row: {e}")))?;
    let serde_json::Value::Object(mut data) = value else {
        return Err(Error::internal("config row did not serialize to an object"));
    };
    data.remove("id");
    Ok(Record {
        table_name: CONFIG_TABLE.to_string(),
        data,
    })
}
