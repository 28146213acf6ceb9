//! # odk-sqlite
//!
//! Session layer over [`odk_sqlite_conn`] for an offline-first data
//! collection client.
//!
//! ## Core Types
//!
//! - **[`AppContext`]**: Sessions and the shared operation log of one application
//! - **[`Database`]**: Reference-counted session with nested transactions
//! - **[`Cursor`]**: Lazily paged query result
//! - **[`Query`]**: SELECT builder; see also the insert/update/delete helpers on [`Database`]
//! - **[`TransactionListener`]**: Begin/commit/rollback hooks
//! - **[`Error`]**: Error type for session operations
//!
//! ## Example
//!
//! ```no_run
//! use odk_sqlite::{AppContext, ContentValues, Query};
//! use odk_sqlite_conn::{DatabaseConfig, Value};
//!
//! # fn main() -> odk_sqlite::Result<()> {
//! let context = AppContext::new("survey");
//! let db = context.get_or_open("default", DatabaseConfig::new("survey", "/tmp/survey.db"))?;
//!
//! db.execute("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, name TEXT)", &[], None)?;
//!
//! db.begin_transaction_exclusive()?;
//! let mut values = ContentValues::new();
//! values.insert("name".into(), Value::from("a"));
//! db.insert("t", None, &values)?;
//! db.set_transaction_successful()?;
//! db.end_transaction()?;
//!
//! let mut cursor = db.query(&Query::table("t").columns(["id", "name"]), None)?;
//! while cursor.move_to_next()? {
//!    println!("{:?}", cursor.get_string(1)?);
//! }
//! cursor.close();
//!
//! db.release_reference();
//! context.remove_session("default");
//! # Ok(())
//! # }
//! ```

mod context;
mod cursor;
mod database;
mod error;
mod query;
mod transactions;

pub use context::{AppContext, ContextStats, INTERNAL_SESSION_SUFFIX};
pub use cursor::Cursor;
pub use database::Database;
pub use error::{Error, Result};
pub use query::{ConflictAlgorithm, ContentValues, Query, build_delete, build_insert, build_update};
pub use transactions::{TransactionListener, TransactionMode};
