//! Integration tests for RowStore
//!
//! Exercise the schema descriptors against a real SQLite file.

use rowstore::{Column, RowStore, StoreError, Table};
use serde_json::json;
use tempfile::TempDir;

fn users() -> Table {
    Table::new("users")
        .column(Column::integer("id").auto_increment())
        .column(Column::text("email").required().unique())
        .column(Column::boolean("admin"))
}

#[test]
fn test_schema_create_and_unique_constraint() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let store = RowStore::open(temp.path().join("app.db")).unwrap();

    store.exec(&users().create_sql()).unwrap();
    store
        .exec("INSERT INTO users (email, admin) VALUES ('a@example.com', 1)")
        .unwrap();

    let err = store
        .exec("INSERT INTO users (email, admin) VALUES ('a@example.com', 0)")
        .unwrap_err();
    assert!(matches!(err, StoreError::Sqlite(_)));
    assert!(err.to_string().contains("UNIQUE"));
}

#[test]
fn test_validated_row_is_accepted_by_store() {
    let store = RowStore::open_in_memory().unwrap();
    let table = users();
    store.exec(&table.create_sql()).unwrap();

    let row = json!({"email": "b@example.com", "admin": false});
    assert!(table.verify_row(row.as_object().unwrap()).is_empty());

    let inserted = store
        .exec("INSERT INTO users (email, admin) VALUES ('b@example.com', 0)")
        .unwrap();
    assert_eq!(inserted.last_insert_id, 1);

    let rows = store.exec("SELECT id, email, admin FROM users").unwrap();
    assert_eq!(rows.records()[0]["email"], json!("b@example.com"));
}

#[test]
fn test_reopen_persists_rows() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let path = temp.path().join("persist.db");

    {
        let store = RowStore::open(&path).unwrap();
        store
            .exec("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT); INSERT INTO kv VALUES ('a', '1');")
            .unwrap();
    }

    let store = RowStore::open(&path).unwrap();
    let rows = store.exec("SELECT v FROM kv WHERE k = 'a'").unwrap();
    assert_eq!(rows.rows, vec![vec![json!("1")]]);
}
