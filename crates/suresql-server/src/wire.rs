//! Wire envelopes for the gateway API
//!
//! Every endpoint answers with the standard `{status, message, data}`
//! wrapper; the status field mirrors the HTTP status line. Field names on
//! the request shapes are contractual.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use suresql_core::driver::{ExecResult, Filter, ParameterizedSql, Record};

/// Uniform response wrapper for all endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardResponse {
    /// HTTP-style status code, also used on the transport status line
    pub status: u16,
    /// Human-readable outcome
    pub message: String,
    /// Endpoint-specific payload
    pub data: Value,
}

impl StandardResponse {
    /// A 200 response with payload
    pub fn ok(message: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            status: 200,
            message: message.into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    /// An error response with empty payload
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: Value::Null,
        }
    }
}

/// Request shape for effect-producing SQL (`/db/api/sql`) and row-returning
/// raw SQL (`/db/api/querysql`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlRequest {
    /// Raw statements; preferred when both lists are present
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statements: Vec<String>,
    /// Parameterised statements
    #[serde(default, rename = "param_sql", skip_serializing_if = "Vec::is_empty")]
    pub param_sql: Vec<ParameterizedSql>,
    /// Return only the first row; applies to row-returning variants only
    #[serde(default, rename = "single_row")]
    pub single_row: bool,
}

impl SqlRequest {
    /// Whether neither statement list is populated
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty() && self.param_sql.is_empty()
    }
}

/// Request shape for structured queries (`/db/api/query`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Table to query
    pub table: String,
    /// Optional filter; an empty filter means no filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Filter>,
    /// Return only the first row
    #[serde(default, rename = "single_row")]
    pub single_row: bool,
}

/// Request shape for batch inserts (`/db/api/insert`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertRequest {
    /// Records to insert
    pub records: Vec<Record>,
    /// Hint the engine to commit asynchronously where supported
    #[serde(default, rename = "queue")]
    pub queue: bool,
    /// All records belong to one table
    #[serde(default, rename = "same_table")]
    pub same_table: bool,
}

/// Response shape for effect-producing operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlResponse {
    /// One tally per executed statement
    pub results: Vec<ExecResult>,
    /// Wall-clock execution time in milliseconds, measured at the
    /// dispatcher boundary
    pub execution_time: f64,
    /// Total rows affected
    pub rows_affected: i64,
}

/// Response shape for row-returning operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Matching records; always an array, even for single-row requests
    pub records: Vec<Record>,
    /// Wall-clock execution time in milliseconds
    pub execution_time: f64,
    /// Number of records returned
    pub count: usize,
}

/// Per-statement responses for multi-statement row-returning requests
pub type QueryResponseSql = Vec<QueryResponse>;

/// Authentication request (`/db/connect`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Account name
    pub username: String,
    /// Account password, cleared after verification
    #[serde(default)]
    pub password: String,
}

/// Token reissue request (`/db/refresh`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// The live refresh token authorising the reissue
    #[serde(rename = "refresh_token")]
    pub refresh_token: String,
}
