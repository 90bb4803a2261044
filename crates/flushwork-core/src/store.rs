//! The relational store the flush pipeline writes to.
//!
//! The store is an external collaborator: it executes one
//! [`StatementBatch`] at a time inside a transaction opened with
//! [`Store::begin`]. Every batch carries both the rendered SQL (for
//! drivers) and a structured row form (for stores that do not parse SQL).

use crate::error::Error;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// Kind of write a change set or statement batch performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Whether `INSERT ... RETURNING` hands back generated keys for every row.
    ///
    /// Without it, generated-key inserts are sent one row per statement and
    /// the store reports the single generated key.
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }
}

/// Why a statement batch exists within a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchPurpose {
    /// Insert new rows
    Insert,
    /// Second phase of a cycle: populate foreign keys inserted as NULL
    CycleFixup,
    /// Write changed columns of existing rows
    Update,
    /// Null a foreign key so a delete cycle can be broken
    CycleNullOut,
    /// Delete rows
    Delete,
}

/// One row of a statement batch in structured form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRow {
    /// Primary key values, in key-column order. Empty for rows whose key the
    /// store generates.
    pub key: Vec<Value>,
    /// Values aligned with [`StatementBatch::columns`].
    pub values: Vec<Value>,
    /// Version the row must currently carry, for versioned types.
    pub expected_version: Option<Value>,
}

/// A single store round trip: one SQL statement covering one or more rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementBatch {
    pub kind: ChangeKind,
    pub purpose: BatchPurpose,
    pub entity_type: String,
    pub table: String,
    pub key_columns: Vec<String>,
    /// Insert: inserted columns. Update: assigned columns. Delete: empty.
    pub columns: Vec<String>,
    pub rows: Vec<BatchRow>,
    pub version_column: Option<String>,
    /// Generated key columns the store must hand back, one key per row.
    pub returning: Vec<String>,
    pub sql: String,
    pub params: Vec<Value>,
}

impl StatementBatch {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Result of executing a [`StatementBatch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Number of rows the statement affected.
    pub affected: u64,
    /// Generated keys, one per inserted row, in submission order.
    pub generated_keys: Vec<Vec<Value>>,
}

impl BatchResult {
    pub fn affected(affected: u64) -> Self {
        Self {
            affected,
            generated_keys: Vec::new(),
        }
    }
}

/// A relational store capable of executing statement batches transactionally.
///
/// All methods take a [`Cx`] for cancellation and return an [`Outcome`].
/// A flush calls `begin`, then `execute_batch` once per batch in plan
/// order, then exactly one of `commit` or `rollback`.
pub trait Store: Send + Sync {
    /// Dialect used to render SQL for this store.
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    /// Start the flush transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Execute one statement batch inside the open transaction.
    fn execute_batch(
        &self,
        cx: &Cx,
        batch: &StatementBatch,
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send;

    /// Commit the flush transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll the flush transaction back.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}
