//! RowStore - the resource a shared owner holds on behalf of every context
//!
//! A thin executor over an embedded SQLite database plus a declarative column
//! schema used to validate rows before they are handed to the executor.
//!
//! # Example
//!
//! ```ignore
//! use rowstore::{Column, RowStore, Table};
//!
//! let users = Table::new("users")
//!     .column(Column::integer("id").auto_increment())
//!     .column(Column::text("email").required().unique());
//!
//! let store = RowStore::open("app.db")?;
//! store.exec(&users.create_sql())?;
//! let rows = store.exec("SELECT id, email FROM users")?;
//! ```

mod error;
pub mod schema;
mod store;

pub use error::StoreError;
pub use schema::{Column, ColumnType, Table};
pub use store::{RowSet, RowStore};
