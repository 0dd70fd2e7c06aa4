//! StoreHandler - serves routed requests from a RowStore
//!
//! Only the elected owner opens the database. Every other context reaches
//! it through the hub with `exec` or `insert` requests.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rowstore::{RowStore, StoreError, Table};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::hub::CallFailure;
use crate::node::OwnerHandler;

/// Owner handler backed by a RowStore
pub struct StoreHandler {
    /// Database file, in-memory when None
    db_path: Option<PathBuf>,
    tables: Arc<Vec<Table>>,
    store: OnceCell<Arc<Mutex<RowStore>>>,
}

impl StoreHandler {
    pub fn new(db_path: Option<PathBuf>) -> Self {
        debug!(?db_path, "StoreHandler::new: called");
        Self {
            db_path,
            tables: Arc::new(Vec::new()),
            store: OnceCell::new(),
        }
    }

    /// Declare a table created on election and accepted by `insert`
    pub fn with_table(mut self, table: Table) -> Self {
        Arc::make_mut(&mut self.tables).push(table);
        self
    }

    /// Whether the store has been opened
    pub fn is_open(&self) -> bool {
        self.store.initialized()
    }

    fn store(&self) -> Result<Arc<Mutex<RowStore>>, CallFailure> {
        self.store
            .get()
            .cloned()
            .ok_or_else(|| CallFailure::resource("store is not open"))
    }

    async fn run<F>(&self, op: F) -> Result<Value, CallFailure>
    where
        F: FnOnce(&RowStore, &[Table]) -> Result<rowstore::RowSet, StoreError> + Send + 'static,
    {
        let store = self.store()?;
        let tables = Arc::clone(&self.tables);

        let result = tokio::task::spawn_blocking(move || {
            let store = store.lock().map_err(|_| CallFailure::resource("store lock poisoned"))?;
            op(&store, &tables).map_err(failure_from)
        })
        .await
        .map_err(|e| CallFailure::resource(format!("store task failed: {}", e)))??;

        serde_json::to_value(result).map_err(|e| CallFailure::resource(e.to_string()))
    }
}

fn failure_from(err: StoreError) -> CallFailure {
    match err {
        StoreError::Invalid(_) | StoreError::EmptyStatement => CallFailure::rejected(err.to_string()),
        other => CallFailure::resource(other.to_string()),
    }
}

fn str_field<'a>(payload: &'a Value, field: &str, kind: &str) -> Result<&'a str, CallFailure> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| CallFailure::rejected(format!("{} requires a '{}' string", kind, field)))
}

#[async_trait]
impl OwnerHandler for StoreHandler {
    async fn on_elected(&self) -> eyre::Result<()> {
        let db_path = self.db_path.clone();
        let tables = Arc::clone(&self.tables);

        let store = tokio::task::spawn_blocking(move || -> Result<RowStore, StoreError> {
            let store = match &db_path {
                Some(path) => RowStore::open(path)?,
                None => RowStore::open_in_memory()?,
            };
            for table in tables.iter() {
                store.exec(&table.create_sql())?;
            }
            Ok(store)
        })
        .await??;

        info!(db_path = ?self.db_path, tables = self.tables.len(), "Store opened by owner");
        self.store
            .set(Arc::new(Mutex::new(store)))
            .map_err(|_| eyre::eyre!("store already open"))
    }

    async fn handle(&self, kind: &str, payload: Value) -> Result<Value, CallFailure> {
        debug!(%kind, "StoreHandler::handle: called");
        match kind {
            "exec" => {
                let sql = str_field(&payload, "sql", kind)?.to_string();
                self.run(move |store, _| store.exec(&sql)).await
            }
            "insert" => {
                let table_name = str_field(&payload, "table", kind)?.to_string();
                let row = payload
                    .get("row")
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or_else(|| CallFailure::rejected("insert requires a 'row' object"))?;
                if !self.tables.iter().any(|t| t.name() == table_name) {
                    return Err(CallFailure::rejected(format!("unknown table {}", table_name)));
                }

                self.run(move |store, tables| {
                    let table = tables
                        .iter()
                        .find(|t| t.name() == table_name)
                        .ok_or_else(|| StoreError::Invalid(vec![format!("unknown table {}", table_name)]))?;
                    store.insert(table, &row)
                })
                .await
            }
            other => Err(CallFailure::rejected(format!("unsupported request kind '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::FailureKind;
    use rowstore::Column;
    use serde_json::json;
    use tempfile::TempDir;

    fn notes() -> Table {
        Table::new("notes")
            .column(Column::integer("id").auto_increment())
            .column(Column::text("body").required().max_len(20))
    }

    #[tokio::test]
    async fn test_requests_fail_before_election() {
        let handler = StoreHandler::new(None);
        let err = handler.handle("exec", json!({"sql": "SELECT 1"})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Resource);
        assert!(!handler.is_open());
    }

    #[tokio::test]
    async fn test_on_elected_creates_tables_on_disk() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("data").join("app.db");
        let handler = StoreHandler::new(Some(db_path.clone())).with_table(notes());

        handler.on_elected().await.unwrap();
        assert!(handler.is_open());
        assert!(db_path.exists());

        let result = handler
            .handle("exec", json!({"sql": "SELECT count(*) AS n FROM notes"}))
            .await
            .unwrap();
        assert_eq!(result["rows"], json!([[0]]));
    }

    #[tokio::test]
    async fn test_exec_returns_rowset_json() {
        let handler = StoreHandler::new(None);
        handler.on_elected().await.unwrap();

        handler
            .handle("exec", json!({"sql": "CREATE TABLE t (x INTEGER)"}))
            .await
            .unwrap();
        let inserted = handler
            .handle("exec", json!({"sql": "INSERT INTO t VALUES (42)"}))
            .await
            .unwrap();
        assert_eq!(inserted["changes"], json!(1));
        assert_eq!(inserted["last-insert-id"], json!(1));

        let rows = handler.handle("exec", json!({"sql": "SELECT x FROM t"})).await.unwrap();
        assert_eq!(rows["columns"], json!(["x"]));
        assert_eq!(rows["rows"], json!([[42]]));
    }

    #[tokio::test]
    async fn test_sql_error_is_resource_failure() {
        let handler = StoreHandler::new(None);
        handler.on_elected().await.unwrap();

        let err = handler
            .handle("exec", json!({"sql": "SELECT * FROM missing"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Resource);
        assert!(err.message.contains("missing"));
    }

    #[tokio::test]
    async fn test_malformed_payloads_rejected() {
        let handler = StoreHandler::new(None).with_table(notes());
        handler.on_elected().await.unwrap();

        let err = handler.handle("exec", json!({"query": "SELECT 1"})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);

        let err = handler.handle("vacuum", json!({})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);

        let err = handler
            .handle("insert", json!({"table": "nope", "row": {}}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);
    }

    #[tokio::test]
    async fn test_insert_validates_against_schema() {
        let handler = StoreHandler::new(None).with_table(notes());
        handler.on_elected().await.unwrap();

        let ok = handler
            .handle("insert", json!({"table": "notes", "row": {"body": "hello"}}))
            .await
            .unwrap();
        assert_eq!(ok["last-insert-id"], json!(1));

        let err = handler
            .handle("insert", json!({"table": "notes", "row": {"body": "x".repeat(30)}}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);
        assert!(err.message.contains("at most 20 characters"));
    }

    #[tokio::test]
    async fn test_second_election_fails() {
        let handler = StoreHandler::new(None);
        handler.on_elected().await.unwrap();
        assert!(handler.on_elected().await.is_err());
    }
}
