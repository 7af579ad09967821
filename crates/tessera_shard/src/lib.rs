//! Storage-shard interface for the tessera distributed SQL front-end.
//!
//! A storage node hosts one independent SQLite database per logical shard
//! slot; every call through [`ShardClient`] addresses one slot. The router
//! never reaches into a shard's schema directly: it sends rendered SQL
//! with positional parameters and receives rows keyed by result-column
//! name. Shards know nothing about each other; cross-shard semantics live
//! entirely in the conductor.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// One SQL value as stored in and returned from a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Canonical display form shared by shard routing and index keys.
    ///
    /// Integral reals collapse to their integer rendering so the same
    /// logical value hashes identically regardless of its storage class.
    pub fn display_string(&self) -> String {
        match self {
            SqlValue::Null => "null".to_string(),
            SqlValue::Integer(v) => v.to_string(),
            SqlValue::Real(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15 {
                    format!("{}", *v as i64)
                } else {
                    v.to_string()
                }
            }
            SqlValue::Text(v) => v.clone(),
            SqlValue::Blob(bytes) => hex(bytes),
        }
    }

    /// JSON form used when composite index keys are canonicalized.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Integer(v) => serde_json::Value::from(*v),
            SqlValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            SqlValue::Text(v) => serde_json::Value::from(v.clone()),
            SqlValue::Blob(bytes) => serde_json::Value::from(hex(bytes)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_string())
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(v) => SqlValue::Integer(v),
            ValueRef::Real(v) => SqlValue::Real(v),
            ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

/// One result row, keyed by result-column name.
pub type Row = BTreeMap<String, SqlValue>;

/// Declared intent of a statement sent to a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Read,
    Write,
    Ddl,
}

/// One rendered statement plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub kind: StatementKind,
}

impl ShardStatement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>, kind: StatementKind) -> Self {
        Self {
            sql: sql.into(),
            params,
            kind,
        }
    }
}

/// Result of one statement on one shard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("statement declared as a read produced no result columns: {sql}")]
    NotARead { sql: String },
    #[error("shard node unavailable: {0}")]
    Unavailable(String),
}

/// Async seam between the conductor and one physical storage node.
///
/// Every call names the logical shard slot it addresses; slots are
/// independent databases. `execute_batch` runs its statements inside a
/// single transaction on the slot; the capture/write statement pairs
/// emitted for index maintenance rely on that atomicity.
#[async_trait]
pub trait ShardClient: Send + Sync {
    fn node_id(&self) -> &str;

    async fn execute(
        &self,
        shard_id: u32,
        statement: ShardStatement,
    ) -> Result<ShardResult, ShardError>;

    async fn execute_batch(
        &self,
        shard_id: u32,
        statements: Vec<ShardStatement>,
    ) -> Result<Vec<ShardResult>, ShardError>;
}

/// In-process storage node: one SQLite database per shard slot, opened
/// lazily on first use.
pub struct SqliteShardNode {
    node_id: String,
    data_dir: Option<PathBuf>,
    slots: Mutex<BTreeMap<u32, Connection>>,
}

impl SqliteShardNode {
    /// Opens a node whose slots live in memory (tests, demos).
    pub fn open_in_memory(node_id: impl Into<String>) -> Result<Self, ShardError> {
        Ok(Self {
            node_id: node_id.into(),
            data_dir: None,
            slots: Mutex::new(BTreeMap::new()),
        })
    }

    /// Opens a node whose slot databases live under `data_dir`.
    pub fn open(node_id: impl Into<String>, data_dir: &Path) -> Result<Self, ShardError> {
        Ok(Self {
            node_id: node_id.into(),
            data_dir: Some(data_dir.to_path_buf()),
            slots: Mutex::new(BTreeMap::new()),
        })
    }

    fn open_slot(&self, shard_id: u32) -> Result<Connection, ShardError> {
        match &self.data_dir {
            Some(dir) => {
                let path = dir.join(format!("{}-shard-{shard_id}.db", self.node_id));
                Ok(Connection::open(path)?)
            }
            None => Ok(Connection::open_in_memory()?),
        }
    }
}

#[async_trait]
impl ShardClient for SqliteShardNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn execute(
        &self,
        shard_id: u32,
        statement: ShardStatement,
    ) -> Result<ShardResult, ShardError> {
        let mut slots = self.slots.lock().await;
        if !slots.contains_key(&shard_id) {
            let conn = self.open_slot(shard_id)?;
            slots.insert(shard_id, conn);
        }
        let conn = slots.get_mut(&shard_id).expect("slot just inserted");
        run_statement(conn, &statement)
    }

    async fn execute_batch(
        &self,
        shard_id: u32,
        statements: Vec<ShardStatement>,
    ) -> Result<Vec<ShardResult>, ShardError> {
        let mut slots = self.slots.lock().await;
        if !slots.contains_key(&shard_id) {
            let conn = self.open_slot(shard_id)?;
            slots.insert(shard_id, conn);
        }
        let conn = slots.get_mut(&shard_id).expect("slot just inserted");
        let tx = conn.transaction()?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in &statements {
            results.push(run_statement(&tx, statement)?);
        }
        tx.commit()?;
        Ok(results)
    }
}

/// Executes one statement on an open connection.
///
/// Statements with result columns (reads, and writes using RETURNING) are
/// materialized row by row; everything else reports `rows_affected` only.
fn run_statement(conn: &Connection, statement: &ShardStatement) -> Result<ShardResult, ShardError> {
    let mut stmt = conn.prepare(&statement.sql)?;
    let params = rusqlite::params_from_iter(statement.params.iter());

    if stmt.column_count() == 0 {
        if statement.kind == StatementKind::Read {
            return Err(ShardError::NotARead {
                sql: statement.sql.clone(),
            });
        }
        let affected = stmt.execute(params)?;
        return Ok(ShardResult {
            rows: Vec::new(),
            rows_affected: affected as u64,
        });
    }

    let column_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (idx, name) in column_names.iter().enumerate() {
            record.insert(name.clone(), SqlValue::from(row.get_ref(idx)?));
        }
        out.push(record);
    }
    drop(rows);
    drop(stmt);

    // Writes with RETURNING report both the rows and the change count.
    let rows_affected = if statement.kind == StatementKind::Write {
        conn.changes()
    } else {
        0
    };
    Ok(ShardResult {
        rows: out,
        rows_affected,
    })
}
