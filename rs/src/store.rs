//! Core RowStore implementation

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema::Table;

/// Result of executing a statement
///
/// Queries fill `columns` and `rows`; writes leave them empty and report
/// `changes` and `last_insert_id` instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub changes: u64,
    #[serde(rename = "last-insert-id")]
    pub last_insert_id: i64,
}

impl RowSet {
    /// Rows as JSON objects keyed by column name
    pub fn records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| self.columns.iter().cloned().zip(row.iter().cloned()).collect())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Embedded SQLite database executing raw statements
pub struct RowStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl RowStore {
    /// Open or create a database file, creating parent directories as needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        info!(?path, "RowStore opened");
        Ok(Self { conn, path: Some(path) })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        debug!("RowStore::open_in_memory: opened");
        Ok(Self { conn, path: None })
    }

    /// Database file path, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Execute SQL and collect its result
    ///
    /// A single statement is prepared so that result rows can be returned.
    /// Scripts with several statements run as a batch and only report changes.
    pub fn exec(&self, sql: &str) -> Result<RowSet, StoreError> {
        let sql = sql.trim();
        debug!(%sql, "RowStore::exec: called");
        if sql.is_empty() {
            return Err(StoreError::EmptyStatement);
        }

        let mut stmt = match self.conn.prepare(sql) {
            Ok(stmt) => stmt,
            Err(rusqlite::Error::MultipleStatement) => {
                debug!("RowStore::exec: multiple statements, running as batch");
                self.conn.execute_batch(sql)?;
                return Ok(RowSet {
                    changes: self.conn.changes() as u64,
                    last_insert_id: self.conn.last_insert_rowid(),
                    ..Default::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        if stmt.column_count() == 0 {
            let changes = stmt.execute([])?;
            debug!(changes, "RowStore::exec: statement executed");
            return Ok(RowSet {
                changes: changes as u64,
                last_insert_id: self.conn.last_insert_rowid(),
                ..Default::default()
            });
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(to_json(row.get_ref(i)?));
            }
            rows.push(values);
        }

        debug!(rows = rows.len(), "RowStore::exec: query returned");
        Ok(RowSet {
            columns,
            rows,
            changes: 0,
            last_insert_id: self.conn.last_insert_rowid(),
        })
    }

    /// Validate a row against `table` and insert it
    ///
    /// Nothing is written if any column fails validation; the error lists
    /// every violation.
    pub fn insert(&self, table: &Table, row: &Map<String, Value>) -> Result<RowSet, StoreError> {
        debug!(table = %table.name(), "RowStore::insert: called");
        let violations = table.verify_row(row);
        if !violations.is_empty() {
            return Err(StoreError::Invalid(violations));
        }

        let names: Vec<&str> = table
            .columns()
            .iter()
            .map(|c| c.name())
            .filter(|name| row.contains_key(*name))
            .collect();

        let sql = if names.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table.name())
        } else {
            let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table.name(),
                names.join(", "),
                placeholders.join(", ")
            )
        };
        let params: Vec<SqlValue> = names.iter().map(|name| to_sql(&row[*name])).collect();

        let changes = self.conn.execute(&sql, params_from_iter(params))?;
        Ok(RowSet {
            changes: changes as u64,
            last_insert_id: self.conn.last_insert_rowid(),
            ..Default::default()
        })
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}
