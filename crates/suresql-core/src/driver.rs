//! The database capability contract
//!
//! A [`Driver`] abstracts one backing SQL engine. Every session owns a
//! driver instance for its whole lifetime; the dispatcher talks to the
//! contract only, never to a concrete engine. Operations come in three
//! families: row-returning (select), effect-producing (exec/insert, tallied
//! per statement), and status/schema introspection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::Result;

/// One database record: a table name plus a column→value map.
///
/// Field names are part of the wire contract for insert requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Table the record belongs to
    #[serde(rename = "TableName")]
    pub table_name: String,
    /// Column values
    #[serde(rename = "Data")]
    pub data: Map<String, Value>,
}

impl Record {
    /// Create an empty record for a table
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table_name: table.into(),
            data: Map::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(column.into(), value.into());
        self
    }

    /// Get a column value
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    /// Get a column as a string slice
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.data.get(column).and_then(Value::as_str)
    }

    /// Get a column as an integer
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.data.get(column).and_then(Value::as_i64)
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// A structured query predicate: a leaf `(field, operator, value)` or a
/// composite carrying nested filters, plus ordering and pagination.
///
/// A filter with every field zero-valued is equivalent to no filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Leaf: column name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
    /// Leaf: comparison operator (`=`, `!=`, `<`, `LIKE`, ...)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,
    /// Leaf: comparison value
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
    /// Composite: nested filters, combined with AND
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<Filter>,
    /// `ORDER BY` clauses, e.g. `"username ASC"`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<String>,
    /// `GROUP BY` columns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    /// Row limit; 0 means unlimited
    #[serde(default, skip_serializing_if = "is_zero")]
    pub limit: i64,
    /// Row offset; 0 means none
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: i64,
}

impl Filter {
    /// A leaf predicate
    pub fn leaf(
        field: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Whether every field is zero-valued, i.e. the filter means "no filter"
    pub fn is_empty(&self) -> bool {
        self.field.is_empty()
            && self.nested.is_empty()
            && self.order_by.is_empty()
            && self.group_by.is_empty()
            && self.limit == 0
            && self.offset == 0
    }
}

/// A SQL statement with positional parameter values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterizedSql {
    /// The statement text, with placeholders
    pub query: String,
    /// Positional values
    #[serde(default)]
    pub values: Vec<Value>,
}

impl ParameterizedSql {
    /// Create a parameterised statement
    pub fn new(query: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            values,
        }
    }
}

/// Per-statement effect tally for non-row operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Rows changed by the statement
    pub rows_affected: i64,
    /// Last auto-generated id, when the engine reports one
    #[serde(default)]
    pub last_insert_id: i64,
    /// Per-statement error, for batch operations that continue past failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status of one peer node, as listed in the settings table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// Node id string (the gateway node number, as text)
    pub node_id: String,
    /// Node number within the configured cluster
    pub node_number: i64,
    /// Reachable URL
    pub url: String,
    /// Total nodes in the cluster
    pub nodes: i64,
    /// Read/write mode (`r`, `w`, `rw`)
    pub mode: String,
    /// Configured pool capacity on that node
    pub max_pool: i64,
}

/// Node status snapshot: the gateway's own identity merged with whatever the
/// backing engine reports (leader, sizes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Service version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// True when this node's number equals the leader slot
    #[serde(default)]
    pub is_leader: bool,
    /// This node's facing URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Read/write mode
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    /// Total nodes configured
    #[serde(default)]
    pub nodes: i64,
    /// This node's number
    #[serde(default)]
    pub node_number: i64,
    /// Node id string
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    /// Configured DBMS kind
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dbms: String,
    /// Driver id tag set at construction
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dbms_driver: String,
    /// Effective pool capacity
    #[serde(default)]
    pub max_pool: i64,
    /// Leader address as reported by the engine
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub leader: String,
    /// On-disk directory size reported by the engine
    #[serde(default)]
    pub dir_size: i64,
    /// Database size reported by the engine
    #[serde(default)]
    pub db_size: i64,
    /// Last backup time, when the engine tracks one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<DateTime<Utc>>,
    /// Service start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Uptime in seconds, refreshed on read
    #[serde(default)]
    pub uptime_secs: u64,
    /// Peer nodes keyed by node number
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peers: BTreeMap<i64, PeerStatus>,
}

/// One column of an introspected table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name
    pub name: String,
    /// Engine-reported type
    pub data_type: String,
    /// Whether NULL is allowed
    #[serde(default)]
    pub nullable: bool,
    /// Whether the column is part of the primary key
    #[serde(default)]
    pub primary_key: bool,
}

/// One introspected table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Columns, when the engine exposes them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ColumnSchema>,
    /// Original DDL, when the engine exposes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_sql: Option<String>,
}

/// The abstract database a session talks to.
///
/// `queued` on insert operations hints asynchronous commit where the engine
/// supports it; correctness never depends on its value. A statement that
/// matches zero rows surfaces as [`crate::Error::NoRows`], which callers
/// treat as an empty result rather than a failure.
///
/// Batch operations have default implementations that loop over the
/// one-statement forms; engines with a native batch API override them.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Engine status: size, leader, peer list, node id
    async fn status(&self) -> Result<NodeStatus>;

    /// Whether the connection is currently usable
    async fn is_connected(&self) -> bool;

    /// First record of a table
    async fn select_one(&self, table: &str) -> Result<Record>;

    /// All records of a table
    async fn select_many(&self, table: &str) -> Result<Vec<Record>>;

    /// First record matching a filter
    async fn select_one_with_filter(&self, table: &str, filter: &Filter) -> Result<Record>;

    /// All records matching a filter
    async fn select_many_with_filter(&self, table: &str, filter: &Filter) -> Result<Vec<Record>>;

    /// All rows of one raw statement
    async fn select_one_sql(&self, sql: &str) -> Result<Vec<Record>>;

    /// First row of one raw statement
    async fn select_only_one_sql(&self, sql: &str) -> Result<Record>;

    /// Per-statement row sets for a list of raw statements
    async fn select_many_sql(&self, sql: &[String]) -> Result<Vec<Vec<Record>>> {
        let mut out = Vec::with_capacity(sql.len());
        for stmt in sql {
            out.push(self.select_one_sql(stmt).await?);
        }
        Ok(out)
    }

    /// All rows of one parameterised statement
    async fn select_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<Vec<Record>>;

    /// First row of one parameterised statement
    async fn select_only_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<Record>;

    /// Per-statement row sets for a list of parameterised statements
    async fn select_many_sql_parameterized(
        &self,
        sql: &[ParameterizedSql],
    ) -> Result<Vec<Vec<Record>>> {
        let mut out = Vec::with_capacity(sql.len());
        for stmt in sql {
            out.push(self.select_one_sql_parameterized(stmt).await?);
        }
        Ok(out)
    }

    /// Execute one raw statement
    async fn exec_one_sql(&self, sql: &str) -> Result<ExecResult>;

    /// Execute a list of raw statements
    async fn exec_many_sql(&self, sql: &[String]) -> Result<Vec<ExecResult>> {
        let mut out = Vec::with_capacity(sql.len());
        for stmt in sql {
            out.push(self.exec_one_sql(stmt).await?);
        }
        Ok(out)
    }

    /// Execute one parameterised statement
    async fn exec_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<ExecResult>;

    /// Execute a list of parameterised statements
    async fn exec_many_sql_parameterized(
        &self,
        sql: &[ParameterizedSql],
    ) -> Result<Vec<ExecResult>> {
        let mut out = Vec::with_capacity(sql.len());
        for stmt in sql {
            out.push(self.exec_one_sql_parameterized(stmt).await?);
        }
        Ok(out)
    }

    /// Insert one record
    async fn insert_one_record(&self, record: &Record, queued: bool) -> Result<ExecResult>;

    /// Insert records that all belong to the same table
    async fn insert_many_records_same_table(
        &self,
        records: &[Record],
        queued: bool,
    ) -> Result<Vec<ExecResult>> {
        self.insert_many_records(records, queued).await
    }

    /// Insert heterogeneous records
    async fn insert_many_records(
        &self,
        records: &[Record],
        queued: bool,
    ) -> Result<Vec<ExecResult>> {
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(self.insert_one_record(record, queued).await?);
        }
        Ok(out)
    }

    /// Introspect the schema. `include_internal` also lists `_`-prefixed
    /// tables.
    async fn schema(&self, include_internal: bool) -> Result<Vec<TableSchema>>;

    /// Release the underlying connection, best-effort
    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Driver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_means_no_filter() {
        assert!(Filter::default().is_empty());
        assert!(!Filter::leaf("id", "=", 42).is_empty());

        let paged = Filter {
            limit: 10,
            ..Default::default()
        };
        assert!(!paged.is_empty());
    }

    #[test]
    fn test_filter_wire_shape() {
        let f: Filter = serde_json::from_str(r#"{"field":"id","operator":"=","value":42}"#)
            .expect("filter should deserialize");
        assert_eq!(f, Filter::leaf("id", "=", 42));

        let composite: Filter = serde_json::from_str(
            r#"{"nested":[{"field":"a","operator":"=","value":1}],"order_by":["a DESC"],"limit":5}"#,
        )
        .expect("composite filter should deserialize");
        assert_eq!(composite.nested.len(), 1);
        assert_eq!(composite.order_by, vec!["a DESC"]);
        assert_eq!(composite.limit, 5);
    }

    #[test]
    fn test_record_wire_shape() {
        let rec: Record =
            serde_json::from_str(r#"{"TableName":"t1","Data":{"id":1,"name":"x"}}"#)
                .expect("record should deserialize");
        assert_eq!(rec.table_name, "t1");
        assert_eq!(rec.get_i64("id"), Some(1));
        assert_eq!(rec.get_str("name"), Some("x"));

        let json = serde_json::to_value(&rec).expect("record should serialize");
        assert!(json.get("TableName").is_some());
        assert!(json.get("Data").is_some());
    }

    #[test]
    fn test_exec_result_defaults() {
        let tally = ExecResult::default();
        assert_eq!(tally.rows_affected, 0);
        assert!(tally.error.is_none());

        let json = serde_json::to_string(&tally).expect("serialize");
        assert!(!json.contains("error"));
    }
}
