//! rqlite backend
//!
//! Drives the replicated embedded store over its HTTP API: statements go to
//! `/db/execute`, queries to `/db/query`, status to `/status`. Basic auth,
//! read-consistency level, retry count and timeouts all come from the DBMS
//! configuration. The `queued` insert hint maps to rqlite's queued-write
//! query parameter.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DbmsConfig;
use crate::driver::{
    Driver, ExecResult, Filter, NodeStatus, ParameterizedSql, Record, TableSchema,
};
use crate::error::{Error, Result};

/// Driver-id tag reported in node status
pub const RQLITE_DRIVER_ID: &str = "direct-rqlite";

/// HTTP client for one rqlite connection.
pub struct RqliteDriver {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    consistency: String,
    options: String,
    max_retries: u32,
    retry_timeout: Duration,
    closed: AtomicBool,
}

impl RqliteDriver {
    /// Open a connection and verify the node answers.
    pub async fn connect(config: &DbmsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| Error::driver_with_source("Connect", "cannot build HTTP client", e))?;

        let driver = Self {
            client,
            base_url: config.rqlite_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            consistency: config.consistency.clone(),
            options: config.options.clone(),
            max_retries: config.max_retries(),
            retry_timeout: config.retry_timeout(),
            closed: AtomicBool::new(false),
        };

        // One status round-trip up front surfaces bad endpoints early.
        driver.status().await?;
        Ok(driver)
    }

    fn check_open(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::driver(operation, "connection closed"));
        }
        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if !self.username.is_empty() {
            builder = builder.basic_auth(&self.username, Some(&self.password));
        }
        builder
    }

    async fn post_json(&self, operation: &str, path: &str, body: Value) -> Result<Value> {
        let mut attempt = 0;
        loop {
            let result = self
                .request(reqwest::Method::POST, path)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        return Err(Error::driver(
                            operation,
                            format!("rqlite returned HTTP {status}"),
                        ));
                    }
                    return response.json::<Value>().await.map_err(|e| {
                        Error::driver_with_source(operation, "malformed rqlite response", e)
                    });
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        max = self.max_retries,
                        "rqlite request failed, retrying"
                    );
                    tokio::time::sleep(self.retry_timeout).await;
                }
                Err(e) => {
                    return Err(Error::driver_with_source(
                        operation,
                        "rqlite request failed",
                        e,
                    ))
                }
            }
        }
    }

    /// Join query-string pieces: consistency level, the queued-write flag,
    /// and any configured option pairs.
    fn path_with_params(&self, path: &str, params: &[&str]) -> String {
        let mut pieces: Vec<&str> = params.to_vec();
        if !self.options.is_empty() {
            pieces.push(&self.options);
        }
        if pieces.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", pieces.join("&"))
        }
    }

    fn query_path(&self) -> String {
        let level = if self.consistency.is_empty() {
            String::new()
        } else {
            format!("level={}", self.consistency)
        };
        if level.is_empty() {
            self.path_with_params("/db/query", &[])
        } else {
            self.path_with_params("/db/query", &[&level])
        }
    }

    fn execute_path(&self, queued: bool) -> String {
        if queued {
            self.path_with_params("/db/execute", &["queue"])
        } else {
            self.path_with_params("/db/execute", &[])
        }
    }

    /// Run row-returning statements, one result set per statement.
    async fn query(&self, operation: &str, statements: Vec<Value>) -> Result<Vec<Vec<Record>>> {
        let body = Value::Array(statements);
        let response = self.post_json(operation, &self.query_path(), body).await?;
        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::driver(operation, "rqlite response missing results"))?;

        let mut out = Vec::with_capacity(results.len());
        for result in results {
            if let Some(message) = result.get("error").and_then(Value::as_str) {
                return Err(Error::driver(operation, message.to_string()));
            }
            out.push(rows_from_result(result));
        }
        Ok(out)
    }

    /// Run effect statements, one tally per statement. Per-statement errors
    /// land in the tally; only transport failures abort the batch.
    async fn execute(
        &self,
        operation: &str,
        statements: Vec<Value>,
        queued: bool,
    ) -> Result<Vec<ExecResult>> {
        let body = Value::Array(statements);
        let response = self
            .post_json(operation, &self.execute_path(queued), body)
            .await?;
        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::driver(operation, "rqlite response missing results"))?;

        Ok(results
            .iter()
            .map(|result| ExecResult {
                rows_affected: result
                    .get("rows_affected")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
                last_insert_id: result
                    .get("last_insert_id")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
                error: result
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect())
    }
}

fn statement(sql: &str) -> Value {
    json!([sql])
}

fn parameterized_statement(sql: &ParameterizedSql) -> Value {
    let mut parts = vec![Value::String(sql.query.clone())];
    parts.extend(sql.values.iter().cloned());
    Value::Array(parts)
}

fn rows_from_result(result: &Value) -> Vec<Record> {
    let columns: Vec<String> = result
        .get("columns")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .map(|c| c.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default();
    let values = result
        .get("values")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    values
        .into_iter()
        .map(|row| {
            let mut data = Map::new();
            if let Value::Array(cells) = row {
                for (column, cell) in columns.iter().zip(cells) {
                    data.insert(column.clone(), cell);
                }
            }
            Record {
                table_name: String::new(),
                data,
            }
        })
        .collect()
}

/// Build `SELECT * FROM <table> ...` from a filter tree, with `?`
/// placeholders for every leaf value. The PostgreSQL backend renumbers the
/// placeholders for its dialect.
pub(crate) fn build_filter_select(
    table: &str,
    filter: Option<&Filter>,
    single_row: bool,
) -> ParameterizedSql {
    let mut sql = format!("SELECT * FROM {table}");
    let mut values = Vec::new();

    if let Some(filter) = filter.filter(|f| !f.is_empty()) {
        let clause = where_clause(filter, &mut values);
        if !clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        if !filter.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&filter.group_by.join(", "));
        }
        if !filter.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&filter.order_by.join(", "));
        }
        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", filter.limit));
        } else if single_row {
            sql.push_str(" LIMIT 1");
        }
        if filter.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", filter.offset));
        }
    } else if single_row {
        sql.push_str(" LIMIT 1");
    }

    ParameterizedSql::new(sql, values)
}

fn where_clause(filter: &Filter, values: &mut Vec<Value>) -> String {
    if !filter.nested.is_empty() {
        let parts: Vec<String> = filter
            .nested
            .iter()
            .map(|f| where_clause(f, values))
            .filter(|c| !c.is_empty())
            .collect();
        if parts.is_empty() {
            return String::new();
        }
        return format!("({})", parts.join(" AND "));
    }
    if filter.field.is_empty() {
        return String::new();
    }
    let operator = if filter.operator.is_empty() {
        "="
    } else {
        &filter.operator
    };
    values.push(filter.value.clone());
    format!("{} {} ?", filter.field, operator)
}

fn insert_statement(record: &Record, operation: &str) -> Result<Value> {
    if record.table_name.is_empty() {
        return Err(Error::driver(operation, "record has no table name"));
    }
    if record.data.is_empty() {
        return Err(Error::driver(operation, "record has no columns"));
    }
    let columns: Vec<&String> = record.data.keys().collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        record.table_name,
        columns
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        placeholders
    );
    let mut parts = vec![Value::String(sql)];
    parts.extend(record.data.values().cloned());
    Ok(Value::Array(parts))
}

#[async_trait]
impl Driver for RqliteDriver {
    async fn status(&self) -> Result<NodeStatus> {
        self.check_open("Status")?;
        let response = self
            .request(reqwest::Method::GET, "/status")
            .send()
            .await
            .map_err(|e| Error::driver_with_source("Status", "rqlite status failed", e))?;
        if !response.status().is_success() {
            return Err(Error::driver(
                "Status",
                format!("rqlite returned HTTP {}", response.status()),
            ));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::driver_with_source("Status", "malformed status response", e))?;

        let store = body.get("store").cloned().unwrap_or(Value::Null);
        let status = NodeStatus {
            dbms_driver: RQLITE_DRIVER_ID.to_string(),
            leader: store
                .pointer("/leader/addr")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            node_id: store
                .pointer("/node_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            dir_size: store
                .pointer("/dir_size")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            db_size: store
                .pointer("/sqlite3/db_size")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            nodes: store
                .pointer("/nodes")
                .and_then(Value::as_array)
                .map(|n| n.len() as i64)
                .unwrap_or(0),
            ..Default::default()
        };
        debug!(leader = %status.leader, "rqlite status");
        Ok(status)
    }

    async fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.request(reqwest::Method::GET, "/status")
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn select_one(&self, table: &str) -> Result<Record> {
        self.check_open("SelectOne")?;
        let stmt = build_filter_select(table, None, true);
        let mut sets = self
            .query("SelectOne", vec![parameterized_statement(&stmt)])
            .await?;
        first_record(&mut sets)
    }

    async fn select_many(&self, table: &str) -> Result<Vec<Record>> {
        self.check_open("SelectMany")?;
        let stmt = build_filter_select(table, None, false);
        let mut sets = self
            .query("SelectMany", vec![parameterized_statement(&stmt)])
            .await?;
        non_empty_rows(&mut sets)
    }

    async fn select_one_with_filter(&self, table: &str, filter: &Filter) -> Result<Record> {
        self.check_open("SelectOneWithCondition")?;
        let stmt = build_filter_select(table, Some(filter), true);
        let mut sets = self
            .query(
                "SelectOneWithCondition",
                vec![parameterized_statement(&stmt)],
            )
            .await?;
        first_record(&mut sets)
    }

    async fn select_many_with_filter(&self, table: &str, filter: &Filter) -> Result<Vec<Record>> {
        self.check_open("SelectManyWithCondition")?;
        let stmt = build_filter_select(table, Some(filter), false);
        let mut sets = self
            .query(
                "SelectManyWithCondition",
                vec![parameterized_statement(&stmt)],
            )
            .await?;
        non_empty_rows(&mut sets)
    }

    async fn select_one_sql(&self, sql: &str) -> Result<Vec<Record>> {
        self.check_open("SelectOneSQL")?;
        let mut sets = self.query("SelectOneSQL", vec![statement(sql)]).await?;
        non_empty_rows(&mut sets)
    }

    async fn select_only_one_sql(&self, sql: &str) -> Result<Record> {
        self.check_open("SelectOnlyOneSQL")?;
        let mut sets = self.query("SelectOnlyOneSQL", vec![statement(sql)]).await?;
        first_record(&mut sets)
    }

    async fn select_many_sql(&self, sql: &[String]) -> Result<Vec<Vec<Record>>> {
        self.check_open("SelectManySQL")?;
        let statements = sql.iter().map(|s| statement(s)).collect();
        self.query("SelectManySQL", statements).await
    }

    async fn select_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<Vec<Record>> {
        self.check_open("SelectOneSQLParameterized")?;
        let mut sets = self
            .query(
                "SelectOneSQLParameterized",
                vec![parameterized_statement(sql)],
            )
            .await?;
        non_empty_rows(&mut sets)
    }

    async fn select_only_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<Record> {
        self.check_open("SelectOnlyOneSQLParameterized")?;
        let mut sets = self
            .query(
                "SelectOnlyOneSQLParameterized",
                vec![parameterized_statement(sql)],
            )
            .await?;
        first_record(&mut sets)
    }

    async fn select_many_sql_parameterized(
        &self,
        sql: &[ParameterizedSql],
    ) -> Result<Vec<Vec<Record>>> {
        self.check_open("SelectManySQLParameterized")?;
        let statements = sql.iter().map(parameterized_statement).collect();
        self.query("SelectManySQLParameterized", statements).await
    }

    async fn exec_one_sql(&self, sql: &str) -> Result<ExecResult> {
        self.check_open("ExecOneSQL")?;
        let mut tallies = self
            .execute("ExecOneSQL", vec![statement(sql)], false)
            .await?;
        single_tally(&mut tallies, "ExecOneSQL")
    }

    async fn exec_many_sql(&self, sql: &[String]) -> Result<Vec<ExecResult>> {
        self.check_open("ExecManySQL")?;
        let statements = sql.iter().map(|s| statement(s)).collect();
        self.execute("ExecManySQL", statements, false).await
    }

    async fn exec_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<ExecResult> {
        self.check_open("ExecOneSQLParameterized")?;
        let mut tallies = self
            .execute(
                "ExecOneSQLParameterized",
                vec![parameterized_statement(sql)],
                false,
            )
            .await?;
        single_tally(&mut tallies, "ExecOneSQLParameterized")
    }

    async fn exec_many_sql_parameterized(
        &self,
        sql: &[ParameterizedSql],
    ) -> Result<Vec<ExecResult>> {
        self.check_open("ExecManySQLParameterized")?;
        let statements = sql.iter().map(parameterized_statement).collect();
        self.execute("ExecManySQLParameterized", statements, false)
            .await
    }

    async fn insert_one_record(&self, record: &Record, queued: bool) -> Result<ExecResult> {
        self.check_open("InsertOneDBRecord")?;
        let stmt = insert_statement(record, "InsertOneDBRecord")?;
        let mut tallies = self
            .execute("InsertOneDBRecord", vec![stmt], queued)
            .await?;
        single_tally(&mut tallies, "InsertOneDBRecord")
    }

    async fn insert_many_records(
        &self,
        records: &[Record],
        queued: bool,
    ) -> Result<Vec<ExecResult>> {
        self.check_open("InsertManyDBRecords")?;
        let statements = records
            .iter()
            .map(|r| insert_statement(r, "InsertManyDBRecords"))
            .collect::<Result<Vec<Value>>>()?;
        self.execute("InsertManyDBRecords", statements, queued)
            .await
    }

    async fn schema(&self, include_internal: bool) -> Result<Vec<TableSchema>> {
        self.check_open("GetSchema")?;
        let mut sets = self
            .query(
                "GetSchema",
                vec![statement(
                    "SELECT name, sql FROM sqlite_master WHERE type = 'table'",
                )],
            )
            .await?;
        let rows = sets.pop().unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let name = row.get_str("name")?.to_string();
                if !include_internal && name.starts_with('_') {
                    return None;
                }
                Some(TableSchema {
                    create_sql: row.get_str("sql").map(str::to_string),
                    name,
                    columns: Vec::new(),
                })
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn first_record(sets: &mut Vec<Vec<Record>>) -> Result<Record> {
    sets.pop()
        .and_then(|rows| rows.into_iter().next())
        .ok_or(Error::NoRows)
}

fn non_empty_rows(sets: &mut Vec<Vec<Record>>) -> Result<Vec<Record>> {
    match sets.pop() {
        Some(rows) if !rows.is_empty() => Ok(rows),
        _ => Err(Error::NoRows),
    }
}

fn single_tally(tallies: &mut Vec<ExecResult>, operation: &str) -> Result<ExecResult> {
    let tally = tallies
        .pop()
        .ok_or_else(|| Error::driver(operation, "rqlite returned no result"))?;
    if let Some(message) = &tally.error {
        return Err(Error::driver(operation, message.clone()));
    }
    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_select_plain() {
        let stmt = build_filter_select("orders", None, false);
        assert_eq!(stmt.query, "SELECT * FROM orders");
        assert!(stmt.values.is_empty());

        let stmt = build_filter_select("orders", None, true);
        assert_eq!(stmt.query, "SELECT * FROM orders LIMIT 1");
    }

    #[test]
    fn test_build_select_leaf_filter() {
        let filter = Filter::leaf("id", "=", 42);
        let stmt = build_filter_select("orders", Some(&filter), true);
        assert_eq!(stmt.query, "SELECT * FROM orders WHERE id = ? LIMIT 1");
        assert_eq!(stmt.values, vec![Value::from(42)]);
    }

    #[test]
    fn test_build_select_composite() {
        let filter = Filter {
            nested: vec![
                Filter::leaf("status", "=", "open"),
                Filter::leaf("total", ">", 100),
            ],
            order_by: vec!["total DESC".to_string()],
            limit: 10,
            offset: 5,
            ..Default::default()
        };
        let stmt = build_filter_select("orders", Some(&filter), false);
        assert_eq!(
            stmt.query,
            "SELECT * FROM orders WHERE (status = ? AND total > ?) \
             ORDER BY total DESC LIMIT 10 OFFSET 5"
        );
        assert_eq!(stmt.values.len(), 2);
    }

    #[test]
    fn test_empty_filter_builds_no_where() {
        let stmt = build_filter_select("orders", Some(&Filter::default()), false);
        assert_eq!(stmt.query, "SELECT * FROM orders");
    }

    #[test]
    fn test_insert_statement_shape() {
        let record = Record::new("t1").with("id", 1).with("name", "x");
        let stmt = insert_statement(&record, "InsertOneDBRecord").unwrap();
        let parts = stmt.as_array().unwrap();
        assert_eq!(
            parts[0].as_str().unwrap(),
            "INSERT INTO t1 (id, name) VALUES (?, ?)"
        );
        assert_eq!(parts.len(), 3);

        let empty = Record::new("t1");
        assert!(insert_statement(&empty, "InsertOneDBRecord").is_err());
    }

    fn bare_driver(consistency: &str, options: &str) -> RqliteDriver {
        RqliteDriver {
            client: reqwest::Client::new(),
            base_url: "http://localhost:4001".to_string(),
            username: String::new(),
            password: String::new(),
            consistency: consistency.to_string(),
            options: options.to_string(),
            max_retries: 1,
            retry_timeout: Duration::from_millis(1),
            closed: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_request_paths() {
        let plain = bare_driver("", "");
        assert_eq!(plain.query_path(), "/db/query");
        assert_eq!(plain.execute_path(false), "/db/execute");
        assert_eq!(plain.execute_path(true), "/db/execute?queue");

        let tuned = bare_driver("strong", "timeout=5s&pretty");
        assert_eq!(tuned.query_path(), "/db/query?level=strong&timeout=5s&pretty");
        assert_eq!(tuned.execute_path(true), "/db/execute?queue&timeout=5s&pretty");
    }

    #[test]
    fn test_rows_from_result() {
        let result = json!({
            "columns": ["id", "name"],
            "types": ["integer", "text"],
            "values": [[1, "a"], [2, "b"]]
        });
        let rows = rows_from_result(&result);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_i64("id"), Some(1));
        assert_eq!(rows[1].get_str("name"), Some("b"));
    }
}
