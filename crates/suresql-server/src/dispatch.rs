//! SQL dispatcher
//!
//! Classifies each request shape and routes it to exactly one driver
//! operation:
//!
//! - `SqlRequest` → exec fan-out (one vs many, raw vs parameterised; when
//!   both lists are present the raw statements win)
//! - `QueryRequest` → the single-row × has-filter matrix over the four
//!   structured selects
//! - `SqlRequest` on the query path → row-returning fan-out, `single_row`
//!   picking first-row vs all-rows in the one-statement case
//! - `InsertRequest` → one / many-same-table / many-heterogeneous
//!
//! Execution time is measured here, from just before the driver call to
//! just after, in wall-clock milliseconds. A `no-rows` outcome is not a
//! failure: it becomes an empty result set. Every other driver error is
//! re-raised annotated with the operation label.

use std::time::Instant;

use suresql_core::driver::{Driver, ExecResult, Record};
use suresql_core::error::{Error, Result};
use suresql_core::node::Node;
use suresql_core::validate::validate_table_name;

use crate::wire::{InsertRequest, QueryRequest, QueryResponse, QueryResponseSql, SqlRequest, SqlResponse};

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Execute effect-producing SQL.
pub async fn execute_sql(node: &Node, db: &dyn Driver, req: &SqlRequest) -> Result<SqlResponse> {
    if req.is_empty() {
        return Err(Error::validation("No SQL statements provided"));
    }

    let started = Instant::now();
    let outcome: Result<Vec<ExecResult>> = if !req.statements.is_empty() {
        if req.statements.len() == 1 {
            db.exec_one_sql(&req.statements[0])
                .await
                .map(|tally| vec![tally])
                .map_err(|e| e.with_operation("ExecOneSQL"))
        } else {
            db.exec_many_sql(&req.statements)
                .await
                .map_err(|e| e.with_operation("ExecManySQL"))
        }
    } else if req.param_sql.len() == 1 {
        db.exec_one_sql_parameterized(&req.param_sql[0])
            .await
            .map(|tally| vec![tally])
            .map_err(|e| e.with_operation("ExecOneSQLParameterized"))
    } else {
        db.exec_many_sql_parameterized(&req.param_sql)
            .await
            .map_err(|e| e.with_operation("ExecManySQLParameterized"))
    };

    let execution_time = elapsed_ms(started);
    match outcome {
        Ok(results) => {
            node.metrics.record_query(true, execution_time);
            let rows_affected = results.iter().map(|r| r.rows_affected).sum();
            Ok(SqlResponse {
                results,
                execution_time,
                rows_affected,
            })
        }
        Err(e) => {
            node.metrics.record_query(false, execution_time);
            Err(e)
        }
    }
}

/// Execute a structured query over one table.
pub async fn query(node: &Node, db: &dyn Driver, req: &QueryRequest) -> Result<QueryResponse> {
    if req.table.is_empty() {
        return Err(Error::validation("Table name is required"));
    }
    validate_table_name(&req.table, false)?;

    let filter = req.condition.as_ref().filter(|c| !c.is_empty());
    let started = Instant::now();
    let outcome: Result<Vec<Record>> = match (req.single_row, filter) {
        (true, Some(filter)) => db
            .select_one_with_filter(&req.table, filter)
            .await
            .map(|record| vec![record])
            .map_err(|e| e.with_operation("SelectOneWithCondition")),
        (true, None) => db
            .select_one(&req.table)
            .await
            .map(|record| vec![record])
            .map_err(|e| e.with_operation("SelectOne")),
        (false, Some(filter)) => db
            .select_many_with_filter(&req.table, filter)
            .await
            .map_err(|e| e.with_operation("SelectManyWithCondition")),
        (false, None) => db
            .select_many(&req.table)
            .await
            .map_err(|e| e.with_operation("SelectMany")),
    };

    let execution_time = elapsed_ms(started);
    match outcome {
        Ok(records) => {
            node.metrics.record_query(true, execution_time);
            Ok(QueryResponse {
                count: records.len(),
                records,
                execution_time,
            })
        }
        Err(e) if e.is_no_rows() => {
            node.metrics.record_query(true, execution_time);
            Ok(QueryResponse {
                records: Vec::new(),
                execution_time,
                count: 0,
            })
        }
        Err(e) => {
            node.metrics.record_query(false, execution_time);
            Err(e)
        }
    }
}

/// Execute row-returning raw SQL.
pub async fn query_sql(node: &Node, db: &dyn Driver, req: &SqlRequest) -> Result<QueryResponseSql> {
    if req.is_empty() {
        return Err(Error::validation("No SQL statements provided"));
    }

    let started = Instant::now();
    let outcome: Result<Vec<Vec<Record>>> = if !req.statements.is_empty() {
        if req.statements.len() == 1 {
            if req.single_row {
                db.select_only_one_sql(&req.statements[0])
                    .await
                    .map(|record| vec![vec![record]])
                    .map_err(|e| e.with_operation("SelectOnlyOneSQL"))
            } else {
                db.select_one_sql(&req.statements[0])
                    .await
                    .map(|records| vec![records])
                    .map_err(|e| e.with_operation("SelectOneSQL"))
            }
        } else {
            db.select_many_sql(&req.statements)
                .await
                .map_err(|e| e.with_operation("SelectManySQL"))
        }
    } else if req.param_sql.len() == 1 {
        if req.single_row {
            db.select_only_one_sql_parameterized(&req.param_sql[0])
                .await
                .map(|record| vec![vec![record]])
                .map_err(|e| e.with_operation("SelectOnlyOneSQLParameterized"))
        } else {
            db.select_one_sql_parameterized(&req.param_sql[0])
                .await
                .map(|records| vec![records])
                .map_err(|e| e.with_operation("SelectOneSQLParameterized"))
        }
    } else {
        db.select_many_sql_parameterized(&req.param_sql)
            .await
            .map_err(|e| e.with_operation("SelectManySQLParameterized"))
    };

    let execution_time = elapsed_ms(started);
    let single_statement = req.statements.len() == 1 || req.param_sql.len() == 1;
    match outcome {
        Ok(sets) => {
            node.metrics.record_query(true, execution_time);
            Ok(sets
                .into_iter()
                .map(|records| QueryResponse {
                    count: records.len(),
                    records,
                    execution_time,
                })
                .collect())
        }
        Err(e) if e.is_no_rows() => {
            node.metrics.record_query(true, execution_time);
            // One statement with no rows still answers with its (empty)
            // result set; a batch without attribution answers empty.
            if single_statement {
                Ok(vec![QueryResponse {
                    records: Vec::new(),
                    execution_time,
                    count: 0,
                }])
            } else {
                Ok(Vec::new())
            }
        }
        Err(e) => {
            node.metrics.record_query(false, execution_time);
            Err(e)
        }
    }
}

/// Execute a batch insert.
pub async fn insert(node: &Node, db: &dyn Driver, req: &InsertRequest) -> Result<SqlResponse> {
    if req.records.is_empty() {
        return Err(Error::validation("No records provided"));
    }

    let started = Instant::now();
    let outcome: Result<Vec<ExecResult>> = if req.records.len() == 1 {
        db.insert_one_record(&req.records[0], req.queue)
            .await
            .map(|tally| vec![tally])
            .map_err(|e| e.with_operation("InsertOneDBRecord"))
    } else if req.same_table {
        db.insert_many_records_same_table(&req.records, req.queue)
            .await
            .map_err(|e| e.with_operation("InsertManyDBRecordsSameTable"))
    } else {
        db.insert_many_records(&req.records, req.queue)
            .await
            .map_err(|e| e.with_operation("InsertManyDBRecords"))
    };

    let execution_time = elapsed_ms(started);
    match outcome {
        Ok(results) => {
            node.metrics.record_query(true, execution_time);
            Ok(SqlResponse {
                rows_affected: req.records.len() as i64,
                results,
                execution_time,
            })
        }
        Err(e) => {
            node.metrics.record_query(false, execution_time);
            Err(e)
        }
    }
}
