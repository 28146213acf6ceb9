//! # odk-sqlite-conn
//!
//! Owned SQLite connections for an offline-first data collection client.
//!
//! ## Core Types
//!
//! - **[`Connection`]**: One native database handle behind a reentrant mutex
//! - **[`PreparedStatementCache`]**: LRU cache of compiled statements with a free-list pool
//! - **[`OperationLog`]**: Ring of recent operations shared by an application's connections
//! - **[`CancellationSignal`]**: Token that interrupts an in-flight engine call
//! - **[`CursorWindow`]**: Bounded slice of a result set filled by the connection
//! - **[`DatabaseConfig`]**: Path, open flags, cache size, pragmas and custom functions
//! - **[`Error`]**: Error type for connection operations
//!
//! ## Architecture
//!
//! - **WAL only**: Opening fails unless write-ahead logging is requested
//! - **Verified pragmas**: Page size, foreign keys, WAL limits, locking, journal and sync modes are read back on open
//! - **Statement reuse**: SELECT and row-changing statements are cached; everything else is finalized after use
//! - **Cooperative cancellation**: A progress handler polls an atomic flag only while a signal is attached
//! - **Contained `unsafe`**: All engine calls live in the private `native` module
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use odk_sqlite_conn::{Connection, DatabaseConfig, OperationLog, Value};
//!
//! # fn main() -> odk_sqlite_conn::Result<()> {
//! let log = Arc::new(OperationLog::new("survey"));
//! let conn = Connection::connect(DatabaseConfig::new("survey", "/tmp/survey.db"), "default", log)?;
//!
//! conn.execute("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, name TEXT)", &[], None)?;
//! let id = conn.execute_for_last_inserted_row_id("INSERT INTO t (name) VALUES (?)", &[Value::from("a")], None)?;
//! let name = conn.execute_for_string("SELECT name FROM t WHERE id = ?", &[Value::from(id)], None)?;
//! assert_eq!(name.as_deref(), Some("a"));
//!
//! conn.dispose();
//! # Ok(())
//! # }
//! ```

mod cache;
mod cancellation;
mod config;
mod connection;
mod error;
mod native;
mod operation_log;
mod statement;
mod value;
mod window;

pub use cache::{CacheStats, PreparedStatementCache};
pub use cancellation::{CancelListener, CancellationSignal, InterruptFlag};
pub use config::{
   CustomFunction, DatabaseConfig, FunctionCallback, MAX_SQL_CACHE_SIZE, OpenFlags, PragmaSettings,
   strip_emails,
};
pub use connection::{Connection, Rows};
pub use error::{Error, Result};
pub use operation_log::{OperationLog, OperationRecord};
pub use statement::{StatementInfo, StatementKind, trim_sql_for_display};
pub use value::Value;
pub use window::CursorWindow;
