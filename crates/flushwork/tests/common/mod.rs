//! In-memory relational store for integration tests.
//!
//! Applies structured statement batches to tables held in memory, enforcing
//! primary keys, foreign keys and version predicates the way a database
//! would, and records every call.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use flushwork::prelude::*;
use asupersync::CancelKind;
use flushwork::{BatchRow, ChangeKind, StoreError, StoreErrorKind};

pub type Record = BTreeMap<String, Value>;
type Tables = BTreeMap<String, Vec<Record>>;

#[derive(Debug, Clone)]
struct ForeignKeyConstraint {
    table: String,
    columns: Vec<String>,
    references: String,
    referenced_columns: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    dialect: Dialect,
    committed: Tables,
    working: Option<Tables>,
    foreign_keys: Vec<ForeignKeyConstraint>,
    next_key: i64,
    calls: Vec<String>,
    batches: Vec<StatementBatch>,
    fail_on_batch: Option<(usize, StoreErrorKind)>,
    stall_on_batch: Option<usize>,
    cancel_on_batch: Option<usize>,
    fail_commit: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialect(self, dialect: Dialect) -> Self {
        self.state.lock().unwrap().dialect = dialect;
        self
    }

    /// Declare `table(columns) REFERENCES references(referenced_columns)`,
    /// checked immediately on every statement.
    pub fn foreign_key(
        self,
        table: &str,
        columns: &[&str],
        references: &str,
        referenced_columns: &[&str],
    ) -> Self {
        self.state
            .lock()
            .unwrap()
            .foreign_keys
            .push(ForeignKeyConstraint {
                table: table.to_string(),
                columns: columns.iter().map(|c| (*c).to_string()).collect(),
                references: references.to_string(),
                referenced_columns: referenced_columns.iter().map(|c| (*c).to_string()).collect(),
            });
        self
    }

    /// Insert a committed row directly.
    pub fn seed<const N: usize>(&self, table: &str, pairs: [(&str, Value); N]) {
        let record: Record = pairs
            .into_iter()
            .map(|(c, v)| (c.to_string(), v))
            .collect();
        self.state
            .lock()
            .unwrap()
            .committed
            .entry(table.to_string())
            .or_default()
            .push(record);
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Committed row of `table` whose `column` equals `value`, as a [`Row`].
    pub fn select(&self, table: &str, column: &str, value: &Value) -> Option<Row> {
        self.rows(table)
            .into_iter()
            .find(|r| r.get(column).is_some_and(|v| v.canonical() == value.canonical()))
            .map(Row::from_pairs)
    }

    /// Change a committed value behind the session's back.
    pub fn overwrite(&self, table: &str, key_column: &str, key: &Value, column: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        if let Some(rows) = state.committed.get_mut(table) {
            for row in rows.iter_mut() {
                if row.get(key_column).is_some_and(|v| v.canonical() == key.canonical()) {
                    row.insert(column.to_string(), value.clone());
                }
            }
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn batches(&self) -> Vec<StatementBatch> {
        self.state.lock().unwrap().batches.clone()
    }

    /// Statement batches only, as `"<purpose> <table>"`.
    pub fn statements(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c.as_str(), "begin" | "commit" | "rollback"))
            .collect()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock().unwrap();
        state.calls.clear();
        state.batches.clear();
    }

    /// Fail the `n`th batch (1-based, counted since the last log clear).
    pub fn fail_on_batch(&self, n: usize) {
        self.state.lock().unwrap().fail_on_batch = Some((n, StoreErrorKind::Connection));
    }

    /// Let the `n`th batch hit the statement timeout.
    pub fn time_out_on_batch(&self, n: usize) {
        self.state.lock().unwrap().fail_on_batch = Some((n, StoreErrorKind::Timeout));
    }

    /// Apply the `n`th batch, then cancel the caller's context.
    pub fn cancel_on_batch(&self, n: usize) {
        self.state.lock().unwrap().cancel_on_batch = Some(n);
    }

    /// Never complete the `n`th batch.
    pub fn stall_on_batch(&self, n: usize) {
        self.state.lock().unwrap().stall_on_batch = Some(n);
    }

    pub fn fail_commit(&self) {
        self.state.lock().unwrap().fail_commit = true;
    }

    /// Clear injected failures and the call log.
    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_on_batch = None;
        state.stall_on_batch = None;
        state.cancel_on_batch = None;
        state.fail_commit = false;
        state.calls.clear();
        state.batches.clear();
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().unwrap().working.is_some()
    }
}

fn values_match(record: &Record, columns: &[String], values: &[Value]) -> bool {
    columns.len() == values.len()
        && columns.iter().zip(values).all(|(c, v)| match record.get(c) {
            Some(stored) => stored.canonical() == v.canonical(),
            None => v.is_null(),
        })
}

fn column_values(record: &Record, columns: &[String]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
        .collect()
}

fn constraint(sqlstate: &str, message: String) -> Error {
    Error::Store(StoreError::constraint(sqlstate, message))
}

fn check_references(
    tables: &Tables,
    foreign_keys: &[ForeignKeyConstraint],
    table: &str,
    record: &Record,
) -> Result<()> {
    for fk in foreign_keys.iter().filter(|fk| fk.table == table) {
        let values = column_values(record, &fk.columns);
        if values.iter().any(Value::is_null) {
            continue;
        }
        let exists = tables
            .get(&fk.references)
            .is_some_and(|rows| rows.iter().any(|r| values_match(r, &fk.referenced_columns, &values)));
        if !exists {
            return Err(constraint(
                "23503",
                format!(
                    "insert or update on table \"{table}\" violates foreign key to \"{}\"",
                    fk.references
                ),
            ));
        }
    }
    Ok(())
}

fn check_not_referenced(
    tables: &Tables,
    foreign_keys: &[ForeignKeyConstraint],
    table: &str,
    record: &Record,
) -> Result<()> {
    for fk in foreign_keys.iter().filter(|fk| fk.references == table) {
        let values = column_values(record, &fk.referenced_columns);
        let referenced = tables
            .get(&fk.table)
            .is_some_and(|rows| rows.iter().any(|r| values_match(r, &fk.columns, &values)));
        if referenced {
            return Err(constraint(
                "23503",
                format!(
                    "delete on table \"{table}\" violates foreign key from \"{}\"",
                    fk.table
                ),
            ));
        }
    }
    Ok(())
}

fn row_position(rows: &[Record], batch: &StatementBatch, row: &BatchRow) -> Option<usize> {
    rows.iter().position(|r| {
        values_match(r, &batch.key_columns, &row.key)
            && match (&batch.version_column, &row.expected_version) {
                (Some(column), Some(expected)) => {
                    values_match(r, std::slice::from_ref(column), std::slice::from_ref(expected))
                }
                _ => true,
            }
    })
}

fn apply(
    tables: &mut Tables,
    foreign_keys: &[ForeignKeyConstraint],
    next_key: &mut i64,
    batch: &StatementBatch,
) -> Result<BatchResult> {
    let mut result = BatchResult::default();
    for row in &batch.rows {
        match batch.kind {
            ChangeKind::Create => {
                let mut record: Record = batch
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.values.iter().cloned())
                    .collect();
                if !batch.returning.is_empty() {
                    // Auto-increment past any row already present.
                    let highest = tables
                        .get(&batch.table)
                        .into_iter()
                        .flatten()
                        .filter_map(|r| r.get(&batch.returning[0]).and_then(Value::as_i64))
                        .max()
                        .unwrap_or(0);
                    *next_key = (*next_key).max(highest) + 1;
                    let key: Vec<Value> = batch.returning.iter().map(|_| Value::BigInt(*next_key)).collect();
                    for (column, value) in batch.returning.iter().zip(&key) {
                        record.insert(column.clone(), value.clone());
                    }
                    result.generated_keys.push(key);
                }
                let key = column_values(&record, &batch.key_columns);
                let rows = tables.get(&batch.table).map(Vec::as_slice).unwrap_or_default();
                if rows.iter().any(|r| values_match(r, &batch.key_columns, &key)) {
                    return Err(constraint(
                        "23505",
                        format!("duplicate key value violates unique constraint on \"{}\"", batch.table),
                    ));
                }
                check_references(tables, foreign_keys, &batch.table, &record)?;
                tables.entry(batch.table.clone()).or_default().push(record);
            }
            ChangeKind::Update => {
                let rows = tables.get(&batch.table).map(Vec::as_slice).unwrap_or_default();
                let Some(position) = row_position(rows, batch, row) else {
                    continue;
                };
                let mut record = rows[position].clone();
                for (column, value) in batch.columns.iter().zip(&row.values) {
                    record.insert(column.clone(), value.clone());
                }
                check_references(tables, foreign_keys, &batch.table, &record)?;
                if let Some(rows) = tables.get_mut(&batch.table) {
                    rows[position] = record;
                }
            }
            ChangeKind::Delete => {
                let rows = tables.get(&batch.table).map(Vec::as_slice).unwrap_or_default();
                let Some(position) = row_position(rows, batch, row) else {
                    continue;
                };
                let record = rows[position].clone();
                if let Some(rows) = tables.get_mut(&batch.table) {
                    rows.remove(position);
                }
                check_not_referenced(tables, foreign_keys, &batch.table, &record)?;
            }
        }
        result.affected += 1;
    }
    Ok(result)
}

impl Store for MemoryStore {
    fn dialect(&self) -> Dialect {
        self.state.lock().unwrap().dialect
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.state.lock().unwrap();
        state.calls.push("begin".to_string());
        state.working = Some(state.committed.clone());
        async { Outcome::Ok(()) }
    }

    fn execute_batch(
        &self,
        cx: &Cx,
        batch: &StatementBatch,
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{:?} {}", batch.purpose, batch.table));
        state.batches.push(batch.clone());
        let n = state.batches.len();
        let stall = state.stall_on_batch == Some(n);
        if state.cancel_on_batch == Some(n) {
            cx.cancel_with(CancelKind::User, Some("flush abandoned by caller"));
        }

        let result = if let Some((_, kind)) = state.fail_on_batch.filter(|(at, _)| *at == n) {
            let message = match kind {
                StoreErrorKind::Timeout => "canceling statement due to statement timeout",
                _ => "connection reset by peer",
            };
            Err(Error::Store(StoreError::new(kind, message)))
        } else if let Some(mut tables) = state.working.take() {
            let foreign_keys = state.foreign_keys.clone();
            let applied = apply(&mut tables, &foreign_keys, &mut state.next_key, batch);
            state.working = Some(tables);
            applied
        } else {
            Err(Error::Custom("no open transaction".to_string()))
        };
        drop(state);

        async move {
            if stall {
                std::future::pending::<()>().await;
            }
            match result {
                Ok(r) => Outcome::Ok(r),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.state.lock().unwrap();
        state.calls.push("commit".to_string());
        let result = if state.fail_commit {
            Outcome::Err(Error::Store(StoreError::new(
                StoreErrorKind::Database,
                "could not serialize access",
            )))
        } else {
            if let Some(tables) = state.working.take() {
                state.committed = tables;
            }
            Outcome::Ok(())
        };
        async move { result }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.state.lock().unwrap();
        state.calls.push("rollback".to_string());
        state.working = None;
        async { Outcome::Ok(()) }
    }
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}
