//! PostgreSQL backend (feature `postgres`)
//!
//! Drives a classical relational server through `tokio-postgres`. Statement
//! parameters arrive as JSON values and are mapped to SQL parameters; rows
//! come back as records keyed by column name. Schema introspection targets
//! `information_schema.tables`.
//!
//! The `queued` insert hint has no engine equivalent here and is ignored,
//! which the contract allows.

use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use crate::config::DbmsConfig;
use crate::driver::{
    ColumnSchema, Driver, ExecResult, Filter, NodeStatus, ParameterizedSql, Record, TableSchema,
};
use crate::error::{Error, Result};

/// Driver-id tag reported in node status
pub const POSTGRES_DRIVER_ID: &str = "postgres";

/// Default PostgreSQL port
const DEFAULT_PORT: u16 = 5432;

/// One PostgreSQL connection.
pub struct PostgresDriver {
    client: tokio_postgres::Client,
    connection_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl PostgresDriver {
    /// Connect using host/port/user/password/database from the DBMS config.
    pub async fn connect(config: &DbmsConfig) -> Result<Self> {
        let port: u16 = if config.port.is_empty() {
            DEFAULT_PORT
        } else {
            config.port.parse().map_err(|_| {
                Error::config(format!("invalid PostgreSQL port: {}", config.port))
            })?
        };

        let mut pg = tokio_postgres::Config::new();
        pg.host(if config.host.is_empty() {
            "localhost"
        } else {
            &config.host
        });
        pg.port(port);
        pg.user(&config.username);
        pg.password(&config.password);
        pg.dbname(&config.database);
        pg.ssl_mode(if config.ssl {
            SslMode::Require
        } else {
            SslMode::Disable
        });
        pg.connect_timeout(config.http_timeout());

        let (client, connection) = pg
            .connect(NoTls)
            .await
            .map_err(|e| Error::driver_with_source("Connect", "PostgreSQL connect failed", e))?;

        // The connection object drives the socket until the client drops.
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        Ok(Self {
            client,
            connection_task,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.client.is_closed() {
            return Err(Error::driver(operation, "connection closed"));
        }
        Ok(())
    }

    async fn run_query(
        &self,
        operation: &str,
        sql: &str,
        values: &[Value],
    ) -> Result<Vec<Record>> {
        let params = to_sql_params(values);
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        let rows = self
            .client
            .query(sql, &refs)
            .await
            .map_err(|e| Error::driver_with_source(operation, "query failed", e))?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn run_exec(&self, operation: &str, sql: &str, values: &[Value]) -> Result<ExecResult> {
        let params = to_sql_params(values);
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        let affected = self
            .client
            .execute(sql, &refs)
            .await
            .map_err(|e| Error::driver_with_source(operation, "execute failed", e))?;
        Ok(ExecResult {
            rows_affected: affected as i64,
            last_insert_id: 0,
            error: None,
        })
    }
}

/// Convert JSON parameter values to SQL parameters
fn to_sql_params(values: &[Value]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    values
        .iter()
        .map(|value| -> Box<dyn ToSql + Sync + Send> {
            match value {
                Value::Null => Box::new(Option::<i32>::None),
                Value::Bool(b) => Box::new(*b),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Box::new(i)
                    } else {
                        Box::new(n.as_f64().unwrap_or(0.0))
                    }
                }
                Value::String(s) => Box::new(s.clone()),
                other => Box::new(other.clone()),
            }
        })
        .collect()
}

/// Convert a row to a record, mapping the common column types and falling
/// back to text for the rest.
fn row_to_record(row: &tokio_postgres::Row) -> Record {
    let mut data = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => row
                .try_get::<_, Option<bool>>(idx)
                .ok()
                .flatten()
                .map(Value::Bool),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)
                .ok()
                .flatten()
                .map(|n| Value::Number(n.into())),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)
                .ok()
                .flatten()
                .map(|n| Value::Number(n.into())),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(idx)
                .ok()
                .flatten()
                .map(|n| Value::Number(n.into())),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)
                .ok()
                .flatten()
                .and_then(|n| Number::from_f64(f64::from(n)))
                .map(Value::Number),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(idx)
                .ok()
                .flatten()
                .and_then(Number::from_f64)
                .map(Value::Number),
            Type::JSON | Type::JSONB => row
                .try_get::<_, Option<Value>>(idx)
                .ok()
                .flatten(),
            Type::TIMESTAMP => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_string())),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_rfc3339())),
            _ => row
                .try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(Value::String),
        };
        data.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    Record {
        table_name: String::new(),
        data,
    }
}

/// Rewrite `?` placeholders to PostgreSQL's `$n` form, skipping quoted text.
fn numbered_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 4);
    let mut n = 0;
    let mut in_string = false;
    for c in sql.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                out.push(c);
            }
            '?' if !in_string => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

fn build_select(table: &str, filter: Option<&Filter>, single_row: bool) -> ParameterizedSql {
    // Same shape the rqlite backend builds, then renumbered for PostgreSQL.
    let stmt = crate::rqlite::build_filter_select(table, filter, single_row);
    ParameterizedSql::new(numbered_placeholders(&stmt.query), stmt.values)
}

fn insert_sql(record: &Record, operation: &str) -> Result<(String, Vec<Value>)> {
    if record.table_name.is_empty() {
        return Err(Error::driver(operation, "record has no table name"));
    }
    if record.data.is_empty() {
        return Err(Error::driver(operation, "record has no columns"));
    }
    let columns: Vec<String> = record.data.keys().cloned().collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("${n}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        record.table_name,
        columns.join(", "),
        placeholders.join(", ")
    );
    Ok((sql, record.data.values().cloned().collect()))
}

fn require_rows(rows: Vec<Record>) -> Result<Vec<Record>> {
    if rows.is_empty() {
        Err(Error::NoRows)
    } else {
        Ok(rows)
    }
}

fn require_first(rows: Vec<Record>) -> Result<Record> {
    rows.into_iter().next().ok_or(Error::NoRows)
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn status(&self) -> Result<NodeStatus> {
        self.check_open("Status")?;
        let rows = self
            .run_query(
                "Status",
                "SELECT version() AS version, pg_database_size(current_database()) AS db_size",
                &[],
            )
            .await?;
        let row = rows.first();
        let status = NodeStatus {
            dbms_driver: POSTGRES_DRIVER_ID.to_string(),
            db_size: row.and_then(|r| r.get_i64("db_size")).unwrap_or(0),
            ..Default::default()
        };
        debug!(db_size = status.db_size, "postgres status");
        Ok(status)
    }

    async fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.client.is_closed()
    }

    async fn select_one(&self, table: &str) -> Result<Record> {
        self.check_open("SelectOne")?;
        let stmt = build_select(table, None, true);
        require_first(self.run_query("SelectOne", &stmt.query, &stmt.values).await?)
    }

    async fn select_many(&self, table: &str) -> Result<Vec<Record>> {
        self.check_open("SelectMany")?;
        let stmt = build_select(table, None, false);
        require_rows(self.run_query("SelectMany", &stmt.query, &stmt.values).await?)
    }

    async fn select_one_with_filter(&self, table: &str, filter: &Filter) -> Result<Record> {
        self.check_open("SelectOneWithCondition")?;
        let stmt = build_select(table, Some(filter), true);
        require_first(
            self.run_query("SelectOneWithCondition", &stmt.query, &stmt.values)
                .await?,
        )
    }

    async fn select_many_with_filter(&self, table: &str, filter: &Filter) -> Result<Vec<Record>> {
        self.check_open("SelectManyWithCondition")?;
        let stmt = build_select(table, Some(filter), false);
        require_rows(
            self.run_query("SelectManyWithCondition", &stmt.query, &stmt.values)
                .await?,
        )
    }

    async fn select_one_sql(&self, sql: &str) -> Result<Vec<Record>> {
        self.check_open("SelectOneSQL")?;
        require_rows(self.run_query("SelectOneSQL", sql, &[]).await?)
    }

    async fn select_only_one_sql(&self, sql: &str) -> Result<Record> {
        self.check_open("SelectOnlyOneSQL")?;
        require_first(self.run_query("SelectOnlyOneSQL", sql, &[]).await?)
    }

    async fn select_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<Vec<Record>> {
        self.check_open("SelectOneSQLParameterized")?;
        require_rows(
            self.run_query("SelectOneSQLParameterized", &sql.query, &sql.values)
                .await?,
        )
    }

    async fn select_only_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<Record> {
        self.check_open("SelectOnlyOneSQLParameterized")?;
        require_first(
            self.run_query("SelectOnlyOneSQLParameterized", &sql.query, &sql.values)
                .await?,
        )
    }

    async fn exec_one_sql(&self, sql: &str) -> Result<ExecResult> {
        self.check_open("ExecOneSQL")?;
        self.run_exec("ExecOneSQL", sql, &[]).await
    }

    async fn exec_one_sql_parameterized(&self, sql: &ParameterizedSql) -> Result<ExecResult> {
        self.check_open("ExecOneSQLParameterized")?;
        self.run_exec("ExecOneSQLParameterized", &sql.query, &sql.values)
            .await
    }

    async fn insert_one_record(&self, record: &Record, _queued: bool) -> Result<ExecResult> {
        self.check_open("InsertOneDBRecord")?;
        let (sql, values) = insert_sql(record, "InsertOneDBRecord")?;
        self.run_exec("InsertOneDBRecord", &sql, &values).await
    }

    async fn schema(&self, include_internal: bool) -> Result<Vec<TableSchema>> {
        self.check_open("GetSchema")?;
        let rows = self
            .run_query(
                "GetSchema",
                "SELECT table_name, column_name, data_type, is_nullable \
                 FROM information_schema.tables \
                 JOIN information_schema.columns USING (table_schema, table_name) \
                 WHERE table_schema = 'public' \
                 ORDER BY table_name, ordinal_position",
                &[],
            )
            .await?;

        let mut tables: Vec<TableSchema> = Vec::new();
        for row in rows {
            let Some(name) = row.get_str("table_name").map(str::to_string) else {
                continue;
            };
            if !include_internal && name.starts_with('_') {
                continue;
            }
            if tables.last().map(|t| t.name.as_str()) != Some(name.as_str()) {
                tables.push(TableSchema {
                    name: name.clone(),
                    ..Default::default()
                });
            }
            if let Some(table) = tables.last_mut() {
                table.columns.push(ColumnSchema {
                    name: row.get_str("column_name").unwrap_or_default().to_string(),
                    data_type: row.get_str("data_type").unwrap_or_default().to_string(),
                    nullable: row.get_str("is_nullable") == Some("YES"),
                    primary_key: false,
                });
            }
        }
        Ok(tables)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.connection_task.abort();
        Ok(())
    }
}
