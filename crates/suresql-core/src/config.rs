//! Configuration resolution for a SureSQL node
//!
//! Settings are resolved in layers, highest priority last:
//!
//! 1. built-in defaults
//! 2. the single persisted `_configs` row
//! 3. matching `_settings` rows (`token`, `connection`, `nodes` categories)
//! 4. environment overrides (`SURESQL_*` for this node, `DBMS_*` for the
//!    backing driver)
//!
//! The environment layer is cached after first load; [`reload_dbms_config`]
//! re-reads it. Durations accept `ns`/`µs`/`us`/`ms`/`s`/`m`/`h`/`d`
//! suffixes, compounds allowed (`1h30m`).

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::warn;

use crate::driver::{Driver, PeerStatus, Record};
use crate::error::{Error, Result};
use crate::schema::{CONFIG_TABLE, SETTINGS_TABLE};

/// Node number that owns the leader slot
pub const LEADER_NODE_NUMBER: i64 = 1;

/// Default access-token lifetime
pub const DEFAULT_TOKEN_EXP: Duration = Duration::from_secs(24 * 60 * 60);
/// Default refresh-token lifetime
pub const DEFAULT_REFRESH_EXP: Duration = Duration::from_secs(48 * 60 * 60);
/// Default expiry-sweep interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default HTTP timeout towards the backing engine
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);
/// Default retry backoff towards the backing engine
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(60);
/// Default retry count towards the backing engine
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default pool capacity
pub const DEFAULT_MAX_POOL: usize = 25;
/// Pool enabled by default
pub const DEFAULT_POOL_ENABLED: bool = true;

/// `_settings` category for token lifetimes
pub const SETTING_CATEGORY_TOKEN: &str = "token";
/// Access-token lifetime, minutes, int-value
pub const SETTING_KEY_TOKEN_EXP: &str = "token_exp";
/// Refresh-token lifetime, minutes, int-value
pub const SETTING_KEY_REFRESH_EXP: &str = "refresh_exp";
/// Sweep interval, minutes, int-value
pub const SETTING_KEY_TOKEN_TTL: &str = "token_ttl";

/// `_settings` category for pool tuning
pub const SETTING_CATEGORY_CONNECTION: &str = "connection";
/// Pool capacity, int-value
pub const SETTING_KEY_MAX_POOL: &str = "max_pool";
/// Pool on/off, int-value 1 ⇔ true
pub const SETTING_KEY_ENABLE_POOL: &str = "pool_on";

/// `_settings` category listing cluster nodes
pub const SETTING_CATEGORY_NODES: &str = "nodes";
/// Node entry, text-value `nodeNumber|url|ip|mode`
pub const SETTING_KEY_NODE_NAME: &str = "node_name";
/// Field delimiter inside a node entry
pub const SETTING_NODE_DELIMITER: char = '|';

/// Reserved category
pub const SETTING_CATEGORY_SYSTEM: &str = "system";
/// Sentinel bucket for rows with an unknown or empty category
pub const SETTING_CATEGORY_EMPTY: &str = "nocategory";

// ============================================================================
// Persisted rows
// ============================================================================

/// Secrets and client-facing knobs, nested inside the config row.
///
/// Loaded from the `_configs` row and overridable from the environment.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvSecrets {
    /// Pre-shared token, when configured out-of-band
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Pre-shared refresh token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    /// JWE key material
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jwe_key: String,
    /// JWT key material
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jwt_key: String,
    /// API key clients must present on `/db/connect`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    /// Client id clients must present on `/db/connect`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    /// HTTP timeout towards the engine, seconds
    #[serde(default)]
    pub http_timeout: i64,
    /// Retry backoff towards the engine, seconds
    #[serde(default)]
    pub retry_timeout: i64,
    /// Retry count towards the engine
    #[serde(default)]
    pub max_retries: i64,
}

impl fmt::Debug for EnvSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Redact key material so it never reaches logs.
        f.debug_struct("EnvSecrets")
            .field("token", &redact(&self.token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("jwe_key", &redact(&self.jwe_key))
            .field("jwt_key", &redact(&self.jwt_key))
            .field("api_key", &redact(&self.api_key))
            .field("client_id", &self.client_id)
            .field("http_timeout", &self.http_timeout)
            .field("retry_timeout", &self.retry_timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

fn redact(s: &str) -> &'static str {
    if s.is_empty() {
        ""
    } else {
        "***"
    }
}

/// The single persisted configuration row (`_configs`).
///
/// Lifetimes are stored as integer minutes; zero means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigRow {
    /// Row id (always one row)
    #[serde(default)]
    pub id: i64,
    /// Human label for this node
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    /// IP address, when connecting by address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    /// Hostname
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    /// Port, kept as text so it can be omitted
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,
    /// Whether the facing URL uses https
    #[serde(default)]
    pub ssl: bool,
    /// Backing DBMS kind
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dbms: String,
    /// Read/write mode: `r`, `w`, `rw`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    /// Total nodes in the cluster
    #[serde(default)]
    pub nodes: i64,
    /// This node's number; 1 is the leader slot
    #[serde(default)]
    pub node_number: i64,
    /// Engine-cluster node id
    #[serde(default)]
    pub node_id: i64,
    /// First-boot initialisation flag
    #[serde(default)]
    pub is_init_done: bool,
    /// Split-write flag
    #[serde(default)]
    pub is_split_write: bool,
    /// Credential hashing method tag (`none` disables encryption marker)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encryption_method: String,
    /// Access-token lifetime, minutes
    #[serde(default, rename = "token_exp")]
    pub token_exp_minutes: i64,
    /// Refresh-token lifetime, minutes
    #[serde(default, rename = "refresh_exp")]
    pub refresh_exp_minutes: i64,
    /// Sweep interval, minutes
    #[serde(default, rename = "ttl_ticker")]
    pub ttl_ticker_minutes: i64,
    /// Nested secrets envelope
    #[serde(flatten)]
    pub env: EnvSecrets,
}

impl ConfigRow {
    /// Build from a database record
    pub fn from_record(record: Record) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(record.data))
            .map_err(|e| Error::config(format!("malformed {CONFIG_TABLE} row: {e}")))
    }

    /// This node's facing URL, from ssl/host/port
    pub fn facing_url(&self) -> String {
        let mut url = if self.ssl {
            String::from("https://")
        } else {
            String::from("http://")
        };
        url.push_str(if self.host.is_empty() {
            "localhost"
        } else {
            &self.host
        });
        if !self.port.is_empty() {
            url.push(':');
            url.push_str(&self.port);
        }
        url
    }
}

/// One `_settings` row: a discriminated value tagged by `data_type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingRow {
    /// Row id
    #[serde(default)]
    pub id: i64,
    /// Grouping category; empty files under the sentinel bucket
    #[serde(default)]
    pub category: String,
    /// Type tag: `text`, `int`, `float`, `bool`
    #[serde(default)]
    pub data_type: String,
    /// Key, unique per category
    #[serde(default)]
    pub setting_key: String,
    /// Text payload
    #[serde(default)]
    pub text_value: String,
    /// Integer payload
    #[serde(default)]
    pub int_value: i64,
    /// Float payload
    #[serde(default)]
    pub float_value: f64,
}

/// A typed view of a setting row's payload
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    /// Text payload
    Text(String),
    /// Integer payload
    Int(i64),
    /// Float payload
    Float(f64),
    /// Boolean payload
    Bool(bool),
}

impl SettingRow {
    /// Interpret the payload according to the `data_type` tag.
    ///
    /// Unknown tags fall back to the text payload.
    pub fn value(&self) -> SettingValue {
        match self.data_type.as_str() {
            "int" | "integer" => SettingValue::Int(self.int_value),
            "float" | "double" => SettingValue::Float(self.float_value),
            "bool" | "boolean" => SettingValue::Bool(
                self.text_value == "true"
                    || self.text_value == "1"
                    || self.text_value == "yes"
                    || self.int_value == 1,
            ),
            _ => SettingValue::Text(self.text_value.clone()),
        }
    }
}

/// All settings rows, indexed `category → key → row`.
#[derive(Debug, Clone, Default)]
pub struct Settings(BTreeMap<String, BTreeMap<String, SettingRow>>);

impl Settings {
    /// Empty settings
    pub fn new() -> Self {
        Self::default()
    }

    /// File a row under its category; an empty category goes to the
    /// sentinel bucket.
    pub fn insert(&mut self, mut row: SettingRow) {
        if row.category.is_empty() {
            row.category = SETTING_CATEGORY_EMPTY.to_string();
        }
        self.0
            .entry(row.category.clone())
            .or_default()
            .insert(row.setting_key.clone(), row);
    }

    /// Look up a row by category and key
    pub fn get(&self, category: &str, key: &str) -> Option<&SettingRow> {
        let category = if category.is_empty() {
            SETTING_CATEGORY_EMPTY
        } else {
            category
        };
        self.0.get(category)?.get(key)
    }

    /// All rows of one category
    pub fn category(&self, category: &str) -> Option<&BTreeMap<String, SettingRow>> {
        self.0.get(category)
    }

    /// Number of categories
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no rows are loaded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Effective runtime values after all four layers have been applied
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    /// Access-token lifetime
    pub token_exp: Duration,
    /// Refresh-token lifetime
    pub refresh_exp: Duration,
    /// Expiry-sweep interval
    pub sweep_interval: Duration,
    /// Configured pool capacity, before peer scaling
    pub max_pool: usize,
    /// Whether pooling is on
    pub pool_enabled: bool,
    /// Peers parsed from the `nodes` category, keyed by node number
    pub peers: BTreeMap<i64, PeerStatus>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            token_exp: DEFAULT_TOKEN_EXP,
            refresh_exp: DEFAULT_REFRESH_EXP,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_pool: DEFAULT_MAX_POOL,
            pool_enabled: DEFAULT_POOL_ENABLED,
            peers: BTreeMap::new(),
        }
    }
}

impl ResolvedConfig {
    /// Pool capacity after peer scaling: configured × peer-count when at
    /// least one peer is listed.
    pub fn effective_max_pool(&self) -> usize {
        if self.peers.is_empty() {
            self.max_pool
        } else {
            self.max_pool * self.peers.len()
        }
    }
}

/// Apply layers 1–3: defaults, then the config row, then settings rows.
///
/// Environment overrides (layer 4) are applied separately by
/// [`apply_env_overrides`] so callers can re-run them on reload.
pub fn resolve(config: &ConfigRow, settings: &Settings) -> ResolvedConfig {
    let mut out = ResolvedConfig::default();

    // Layer 2: persisted row, minutes, zero means unset.
    if config.token_exp_minutes > 0 {
        out.token_exp = Duration::from_secs(config.token_exp_minutes as u64 * 60);
    }
    if config.refresh_exp_minutes > 0 {
        out.refresh_exp = Duration::from_secs(config.refresh_exp_minutes as u64 * 60);
    }
    if config.ttl_ticker_minutes > 0 {
        out.sweep_interval = Duration::from_secs(config.ttl_ticker_minutes as u64 * 60);
    }

    // Layer 3: settings rows.
    if let Some(row) = settings.get(SETTING_CATEGORY_TOKEN, SETTING_KEY_TOKEN_EXP) {
        if row.int_value > 0 {
            out.token_exp = Duration::from_secs(row.int_value as u64 * 60);
        }
    }
    if let Some(row) = settings.get(SETTING_CATEGORY_TOKEN, SETTING_KEY_REFRESH_EXP) {
        if row.int_value > 0 {
            out.refresh_exp = Duration::from_secs(row.int_value as u64 * 60);
        }
    }
    if let Some(row) = settings.get(SETTING_CATEGORY_TOKEN, SETTING_KEY_TOKEN_TTL) {
        if row.int_value > 0 {
            out.sweep_interval = Duration::from_secs(row.int_value as u64 * 60);
        }
    }
    if let Some(row) = settings.get(SETTING_CATEGORY_CONNECTION, SETTING_KEY_ENABLE_POOL) {
        out.pool_enabled = row.int_value == 1;
    }
    if let Some(row) = settings.get(SETTING_CATEGORY_CONNECTION, SETTING_KEY_MAX_POOL) {
        out.max_pool = row.int_value.max(0) as usize;
        if out.max_pool == 0 && out.pool_enabled {
            out.max_pool = DEFAULT_MAX_POOL;
        }
    }

    out.peers = parse_peers(settings, config.node_number);
    out
}

/// Parse the `nodes` category into the peer table. Every entry whose node
/// number differs from `current_node` is a peer; malformed entries are
/// skipped with a warning.
pub fn parse_peers(settings: &Settings, current_node: i64) -> BTreeMap<i64, PeerStatus> {
    let mut peers = BTreeMap::new();
    let Some(rows) = settings.category(SETTING_CATEGORY_NODES) else {
        return peers;
    };
    let total = rows.len() as i64;
    for row in rows.values() {
        let parts: Vec<&str> = row.text_value.split(SETTING_NODE_DELIMITER).collect();
        if parts.len() < 4 {
            warn!(
                key = %row.setting_key,
                value = %row.text_value,
                "skipping malformed node entry"
            );
            continue;
        }
        let number: i64 = match parts[0].trim().parse() {
            Ok(n) => n,
            Err(_) => {
                warn!(value = %row.text_value, "skipping node entry with bad number");
                continue;
            }
        };
        if number == current_node {
            continue;
        }
        peers.insert(
            number,
            PeerStatus {
                node_id: parts[0].trim().to_string(),
                node_number: number,
                url: parts[1].trim().to_string(),
                nodes: total,
                mode: parts[3].trim().to_string(),
                max_pool: 0,
            },
        );
    }
    peers
}

// ============================================================================
// Database loaders
// ============================================================================

/// Load the single `_configs` row
pub async fn load_config_row(db: &dyn Driver) -> Result<ConfigRow> {
    let record = db.select_one(CONFIG_TABLE).await?;
    ConfigRow::from_record(record)
}

/// Load every `_settings` row. Zero rows is not an error.
pub async fn load_settings(db: &dyn Driver) -> Result<Settings> {
    let mut settings = Settings::new();
    let records = match db.select_many(SETTINGS_TABLE).await {
        Ok(records) => records,
        Err(e) if e.is_no_rows() => Vec::new(),
        Err(e) => return Err(e),
    };
    for record in records {
        match serde_json::from_value::<SettingRow>(serde_json::Value::Object(record.data)) {
            Ok(row) => settings.insert(row),
            Err(e) => warn!(error = %e, "skipping malformed settings row"),
        }
    }
    Ok(settings)
}

// ============================================================================
// Environment layer
// ============================================================================

/// Driver-facing connection parameters, read from `DBMS_*` environment
/// variables and cached after first load.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbmsConfig {
    /// Engine host
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    /// Engine port, text so it can be omitted
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,
    /// Engine username (basic auth for the embedded store)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Engine password
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Database name (relational server)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database: String,
    /// Whether to connect over TLS
    #[serde(default)]
    pub ssl: bool,
    /// Extra option pairs, already `&`-joined
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub options: String,
    /// Read-consistency level for the embedded store
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub consistency: String,
    /// DBMS kind; blank selects the embedded store
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dbms: String,
    /// HTTP timeout towards the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_timeout: Option<Duration>,
    /// Retry backoff towards the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_timeout: Option<Duration>,
    /// Retry count towards the engine
    #[serde(default)]
    pub max_retries: u32,
}

impl fmt::Debug for DbmsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Redact the password so connection configs can be logged.
        f.debug_struct("DbmsConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("database", &self.database)
            .field("ssl", &self.ssl)
            .field("options", &self.options)
            .field("consistency", &self.consistency)
            .field("dbms", &self.dbms)
            .field("http_timeout", &self.http_timeout)
            .field("retry_timeout", &self.retry_timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl DbmsConfig {
    /// Effective HTTP timeout
    pub fn http_timeout(&self) -> Duration {
        self.http_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT)
    }

    /// Effective retry backoff
    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout.unwrap_or(DEFAULT_RETRY_TIMEOUT)
    }

    /// Effective retry count
    pub fn max_retries(&self) -> u32 {
        if self.max_retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            self.max_retries
        }
    }

    /// Base URL for the embedded store's HTTP API:
    /// `http(s)://host[:port]`, defaulting the host to `localhost`.
    pub fn rqlite_url(&self) -> String {
        let mut url = if self.ssl {
            String::from("https://")
        } else {
            String::from("http://")
        };
        if self.host.is_empty() {
            warn!("no DBMS host configured, defaulting to localhost");
            url.push_str("localhost");
        } else {
            url.push_str(&self.host);
        }
        if !self.port.is_empty() {
            url.push(':');
            url.push_str(&self.port);
        }
        url
    }
}

static CACHED_DBMS_CONFIG: Lazy<RwLock<Option<DbmsConfig>>> = Lazy::new(|| RwLock::new(None));

/// Read the `DBMS_*` environment, cached after the first call.
pub fn dbms_config_from_env() -> DbmsConfig {
    if let Some(cached) = CACHED_DBMS_CONFIG.read().as_ref() {
        return cached.clone();
    }
    reload_dbms_config()
}

/// Force a re-read of the `DBMS_*` environment.
pub fn reload_dbms_config() -> DbmsConfig {
    let config = read_dbms_env();
    *CACHED_DBMS_CONFIG.write() = Some(config.clone());
    config
}

fn read_dbms_env() -> DbmsConfig {
    DbmsConfig {
        host: env_string("DBMS_HOST"),
        port: env_string("DBMS_PORT"),
        username: env_string("DBMS_USERNAME"),
        password: env_string("DBMS_PASSWORD"),
        database: env_string("DBMS_DATABASE"),
        ssl: env_bool("DBMS_SSL"),
        options: env_string("DBMS_OPTIONS"),
        consistency: env_string("DBMS_CONSISTENCY"),
        dbms: env_string("DBMS_TYPE"),
        http_timeout: env_duration("DBMS_HTTP_TIMEOUT"),
        retry_timeout: env_duration("DBMS_RETRY_TIMEOUT"),
        max_retries: env_int("DBMS_MAX_RETRIES").map(|n| n.max(0) as u32).unwrap_or(0),
    }
}

/// Layer 4: overwrite config-row fields and resolved values from
/// `SURESQL_*` variables. A non-empty value wins over every earlier layer;
/// unknown names are ignored.
pub fn apply_env_overrides(config: &mut ConfigRow, resolved: &mut ResolvedConfig) {
    for (name, value) in [
        ("SURESQL_IP", &mut config.ip as &mut String),
        ("SURESQL_HOST", &mut config.host),
        ("SURESQL_PORT", &mut config.port),
        ("SURESQL_DBMS", &mut config.dbms),
        ("SURESQL_API_KEY", &mut config.env.api_key),
        ("SURESQL_CLIENT_ID", &mut config.env.client_id),
        ("SURESQL_TOKEN", &mut config.env.token),
        ("SURESQL_REFRESH_TOKEN", &mut config.env.refresh_token),
        ("SURESQL_JWE_KEY", &mut config.env.jwe_key),
        ("SURESQL_JWT_KEY", &mut config.env.jwt_key),
    ] {
        let v = env_string(name);
        if !v.is_empty() {
            *value = v;
        }
    }

    if let Some(timeout) = env_duration("SURESQL_HTTP_TIMEOUT") {
        config.env.http_timeout = timeout.as_secs() as i64;
    }
    if let Some(timeout) = env_duration("SURESQL_RETRY_TIMEOUT") {
        config.env.retry_timeout = timeout.as_secs() as i64;
    }
    if let Some(retries) = env_int("SURESQL_MAX_RETRIES") {
        if retries > 0 {
            config.env.max_retries = retries;
        }
    }
    if let Some(exp) = env_duration("SURESQL_TOKEN_EXP") {
        resolved.token_exp = exp;
    }
    if let Some(exp) = env_duration("SURESQL_REFRESH_EXP") {
        resolved.refresh_exp = exp;
    }
    if let Some(ttl) = env_duration("SURESQL_TOKEN_TTL") {
        resolved.sweep_interval = ttl;
    }
    if let Some(max) = env_int("SURESQL_MAX_POOL") {
        if max >= 0 {
            resolved.max_pool = max as usize;
        }
    }
}

fn env_string(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn env_bool(name: &str) -> bool {
    matches!(
        env_string(name).to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn env_int(name: &str) -> Option<i64> {
    let v = env_string(name);
    if v.is_empty() {
        return None;
    }
    v.trim().parse().ok()
}

fn env_duration(name: &str) -> Option<Duration> {
    let v = env_string(name);
    if v.is_empty() {
        return None;
    }
    parse_duration(&v)
}

/// Parse a duration like `90s`, `15m`, `1h30m`, `2d`, `250ms`.
///
/// Accepted suffixes: `ns`, `µs`/`us`, `ms`, `s`, `m`, `h`, `d`. A bare
/// number is seconds. Returns `None` on malformed input.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    // Bare number means seconds.
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return None;
        }
        let number: f64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let nanos_per_unit: f64 = match unit {
            "ns" => 1.0,
            "µs" | "us" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60.0 * 1_000_000_000.0,
            "h" => 3_600.0 * 1_000_000_000.0,
            "d" => 86_400.0 * 1_000_000_000.0,
            _ => return None,
        };
        total += Duration::from_nanos((number * nanos_per_unit) as u64);
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_setting(category: &str, key: &str, value: i64) -> SettingRow {
        SettingRow {
            category: category.to_string(),
            data_type: "int".to_string(),
            setting_key: key.to_string(),
            int_value: value,
            ..Default::default()
        }
    }

    fn node_setting(key: &str, value: &str) -> SettingRow {
        SettingRow {
            category: SETTING_CATEGORY_NODES.to_string(),
            data_type: "text".to_string(),
            setting_key: key.to_string(),
            text_value: value.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let resolved = resolve(&ConfigRow::default(), &Settings::new());
        assert_eq!(resolved.token_exp, DEFAULT_TOKEN_EXP);
        assert_eq!(resolved.refresh_exp, DEFAULT_REFRESH_EXP);
        assert_eq!(resolved.sweep_interval, DEFAULT_SWEEP_INTERVAL);
        assert_eq!(resolved.max_pool, DEFAULT_MAX_POOL);
        assert!(resolved.pool_enabled);
        assert!(resolved.peers.is_empty());
    }

    #[test]
    fn test_config_row_layer() {
        let row = ConfigRow {
            token_exp_minutes: 30,
            refresh_exp_minutes: 120,
            ttl_ticker_minutes: 2,
            ..Default::default()
        };
        let resolved = resolve(&row, &Settings::new());
        assert_eq!(resolved.token_exp, Duration::from_secs(30 * 60));
        assert_eq!(resolved.refresh_exp, Duration::from_secs(120 * 60));
        assert_eq!(resolved.sweep_interval, Duration::from_secs(2 * 60));
    }

    #[test]
    fn test_settings_layer_beats_config_row() {
        let row = ConfigRow {
            token_exp_minutes: 30,
            ..Default::default()
        };
        let mut settings = Settings::new();
        settings.insert(int_setting(
            SETTING_CATEGORY_TOKEN,
            SETTING_KEY_TOKEN_EXP,
            15,
        ));
        let resolved = resolve(&row, &settings);
        assert_eq!(resolved.token_exp, Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_max_pool_zero_falls_back_when_pool_enabled() {
        let mut settings = Settings::new();
        settings.insert(int_setting(
            SETTING_CATEGORY_CONNECTION,
            SETTING_KEY_MAX_POOL,
            0,
        ));
        let resolved = resolve(&ConfigRow::default(), &settings);
        assert_eq!(resolved.max_pool, DEFAULT_MAX_POOL);

        // Pool disabled: zero stays zero.
        let mut settings = Settings::new();
        settings.insert(int_setting(
            SETTING_CATEGORY_CONNECTION,
            SETTING_KEY_ENABLE_POOL,
            0,
        ));
        settings.insert(int_setting(
            SETTING_CATEGORY_CONNECTION,
            SETTING_KEY_MAX_POOL,
            0,
        ));
        let resolved = resolve(&ConfigRow::default(), &settings);
        assert!(!resolved.pool_enabled);
        assert_eq!(resolved.max_pool, 0);
    }

    #[test]
    fn test_peer_parsing_excludes_current_node() {
        let config = ConfigRow {
            node_number: 1,
            ..Default::default()
        };
        let mut settings = Settings::new();
        settings.insert(node_setting("node_1", "1|http://a:4001|10.0.0.1|rw"));
        settings.insert(node_setting("node_2", "2|http://b:4001|10.0.0.2|r"));
        settings.insert(node_setting("node_3", "3|http://c:4001|10.0.0.3|r"));
        settings.insert(node_setting("node_bad", "oops"));

        let resolved = resolve(&config, &settings);
        assert_eq!(resolved.peers.len(), 2);
        assert_eq!(resolved.peers[&2].url, "http://b:4001");
        assert_eq!(resolved.peers[&2].mode, "r");
        assert_eq!(resolved.effective_max_pool(), DEFAULT_MAX_POOL * 2);
    }

    #[test]
    fn test_effective_max_without_peers() {
        let resolved = ResolvedConfig {
            max_pool: 10,
            ..Default::default()
        };
        assert_eq!(resolved.effective_max_pool(), 10);
    }

    #[test]
    fn test_unknown_category_goes_to_sentinel() {
        let mut settings = Settings::new();
        settings.insert(SettingRow {
            setting_key: "stray".to_string(),
            ..Default::default()
        });
        assert!(settings.get("", "stray").is_some());
        assert!(settings.get(SETTING_CATEGORY_EMPTY, "stray").is_some());
    }

    #[test]
    fn test_setting_typed_accessor() {
        let row = SettingRow {
            data_type: "int".to_string(),
            int_value: 42,
            ..Default::default()
        };
        assert_eq!(row.value(), SettingValue::Int(42));

        let row = SettingRow {
            data_type: "bool".to_string(),
            text_value: "yes".to_string(),
            ..Default::default()
        };
        assert_eq!(row.value(), SettingValue::Bool(true));

        let row = SettingRow {
            data_type: "mystery".to_string(),
            text_value: "fallback".to_string(),
            ..Default::default()
        };
        assert_eq!(row.value(), SettingValue::Text("fallback".to_string()));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(
            parse_duration("1h30m"),
            Some(Duration::from_secs(90 * 60))
        );
        assert_eq!(parse_duration("2d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration("5µs"), Some(Duration::from_micros(5)));
        assert_eq!(parse_duration("5us"), Some(Duration::from_micros(5)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration("10parsecs"), None);
    }

    #[test]
    fn test_facing_url() {
        let row = ConfigRow {
            host: "db1.example.com".to_string(),
            port: "8080".to_string(),
            ssl: true,
            ..Default::default()
        };
        assert_eq!(row.facing_url(), "https://db1.example.com:8080");

        let bare = ConfigRow::default();
        assert_eq!(bare.facing_url(), "http://localhost");
    }

    #[test]
    fn test_config_row_from_record() {
        let record = Record::new(CONFIG_TABLE)
            .with("label", "node-a")
            .with("host", "10.1.2.3")
            .with("node_number", 2)
            .with("token_exp", 45)
            .with("api_key", "k123");
        let row = ConfigRow::from_record(record).expect("config row");
        assert_eq!(row.label, "node-a");
        assert_eq!(row.node_number, 2);
        assert_eq!(row.token_exp_minutes, 45);
        assert_eq!(row.env.api_key, "k123");
    }

    #[test]
    fn test_secrets_debug_redacts() {
        let secrets = EnvSecrets {
            api_key: "sensitive".to_string(),
            client_id: "client-1".to_string(),
            ..Default::default()
        };
        let debug = format!("{secrets:?}");
        assert!(!debug.contains("sensitive"));
        assert!(debug.contains("client-1"));
    }
}
