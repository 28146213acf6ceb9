//! Integration tests for `Connection` against real database files.

use odk_sqlite_conn::{
   CancellationSignal, Connection, CursorWindow, CustomFunction, DatabaseConfig, Error, OpenFlags,
   OperationLog, Value,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

struct TestConn {
   conn: Connection,
   log: Arc<OperationLog>,
   _dir: tempfile::TempDir,
}

fn config_in(dir: &tempfile::TempDir) -> DatabaseConfig {
   DatabaseConfig::new("test-app", dir.path().join("test.db"))
}

fn open_with(configure: impl FnOnce(DatabaseConfig) -> DatabaseConfig) -> TestConn {
   let dir = tempfile::tempdir().unwrap();
   let config = configure(config_in(&dir));
   let log = Arc::new(OperationLog::new("test-app"));
   let conn = Connection::connect(config, "default", Arc::clone(&log)).unwrap();
   TestConn {
      conn,
      log,
      _dir: dir,
   }
}

fn open_default() -> TestConn {
   open_with(|config| config)
}

fn create_items(conn: &Connection, rows: i64) {
   conn
      .execute(
         "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
         &[],
         None,
      )
      .unwrap();
   for i in 0..rows {
      conn
         .execute(
            "INSERT INTO items (id, name) VALUES (?, ?)",
            &[Value::from(i), Value::from(format!("item-{i}"))],
            None,
         )
         .unwrap();
   }
}

// ============================================================================
// Open and Pragmas
// ============================================================================

#[test]
fn test_open_requires_wal_flag() {
   let dir = tempfile::tempdir().unwrap();
   let config = DatabaseConfig {
      open_flags: OpenFlags::READ_WRITE | OpenFlags::CREATE_IF_NECESSARY,
      ..config_in(&dir)
   };
   let log = Arc::new(OperationLog::new("test-app"));
   let result = Connection::connect(config, "default", log);
   assert!(matches!(result, Err(Error::WalRequired)));
}

#[test]
fn test_open_applies_pragmas() {
   let t = open_with(|config| DatabaseConfig {
      foreign_key_constraints_enabled: true,
      ..config
   });
   let conn = &t.conn;

   assert_eq!(
      conn.execute_for_string("PRAGMA journal_mode", &[], None).unwrap().as_deref(),
      Some("wal")
   );
   assert_eq!(conn.execute_for_long("PRAGMA page_size", &[], None).unwrap(), Some(1024));
   assert_eq!(conn.execute_for_long("PRAGMA foreign_keys", &[], None).unwrap(), Some(1));
   assert_eq!(
      conn.execute_for_long("PRAGMA journal_size_limit", &[], None).unwrap(),
      Some(3_000_000)
   );
   assert_eq!(conn.execute_for_long("PRAGMA wal_autocheckpoint", &[], None).unwrap(), Some(1000));
   assert_eq!(conn.execute_for_long("PRAGMA synchronous", &[], None).unwrap(), Some(2));
   assert_eq!(conn.execute_for_long("PRAGMA busy_timeout", &[], None).unwrap(), Some(5000));
   assert_eq!(t.log.active_connections(), 1);
}

#[test]
fn test_open_missing_directory_fails_and_is_not_counted_active() {
   let dir = tempfile::tempdir().unwrap();
   let config = DatabaseConfig::new("test-app", dir.path().join("missing").join("x.db"));
   let log = Arc::new(OperationLog::new("test-app"));
   let result = Connection::connect(config, "default", Arc::clone(&log));
   assert!(matches!(result, Err(Error::Sqlite { .. })));
   assert_eq!(log.active_connections(), 0);
}

// ============================================================================
// Statement Cache
// ============================================================================

#[test]
fn test_lru_evicts_least_recently_used_statement() {
   let t = open_with(|config| DatabaseConfig {
      max_sql_cache_size: 2,
      ..config
   });
   let conn = &t.conn;

   for sql in ["SELECT 1", "SELECT 2", "SELECT 3"] {
      conn.execute_for_long(sql, &[], None).unwrap();
   }

   let cache = conn.statement_cache();
   assert_eq!(cache.cached_sql(), vec!["SELECT 2".to_string(), "SELECT 3".to_string()]);
   assert!(!cache.contains("SELECT 1"));
   // SELECT 1 was finalized, its shell is back on the free list.
   assert_eq!(cache.live_statements(), 2);
   assert!(cache.pooled() >= 1);
   assert_eq!(conn.cache_stats().size, 2);
}

#[test]
fn test_cache_hit_reuses_statement() {
   let t = open_default();
   let conn = &t.conn;
   let before = conn.cache_stats();

   conn.execute_for_long("SELECT 42", &[], None).unwrap();
   conn.execute_for_long("SELECT 42", &[], None).unwrap();

   let after = conn.cache_stats();
   assert_eq!(after.miss_count - before.miss_count, 1);
   assert_eq!(after.hit_count - before.hit_count, 1);
}

#[test]
fn test_only_select_and_update_statements_stay_cached() {
   let t = open_default();
   let conn = &t.conn;
   create_items(conn, 1);
   conn.execute("PRAGMA user_version = 3", &[], None).unwrap();
   conn.execute("SAVEPOINT s1", &[], None).unwrap();
   conn.execute("RELEASE s1", &[], None).unwrap();
   conn.execute_for_long("SELECT count(*) FROM items", &[], None).unwrap();

   let cached = conn.statement_cache().cached_sql();
   assert_eq!(
      cached,
      vec![
         "INSERT INTO items (id, name) VALUES (?, ?)".to_string(),
         "SELECT count(*) FROM items".to_string(),
      ]
   );

   let mut dump = String::new();
   conn.dump(&mut dump, false);
   assert!(!dump.contains("PRAGMA"));
   assert!(!dump.contains("SAVEPOINT"));
   assert!(!dump.contains("CREATE"));
}

#[test]
fn test_ddl_evicts_cached_statements() {
   let t = open_default();
   let conn = &t.conn;
   conn.execute_for_long("SELECT 1", &[], None).unwrap();
   assert!(conn.statement_cache().contains("SELECT 1"));

   conn.execute("CREATE TABLE other (a)", &[], None).unwrap();
   assert!(conn.statement_cache().cached_sql().is_empty());
}

#[test]
fn test_zero_cache_size_disables_caching() {
   let t = open_with(|config| DatabaseConfig {
      max_sql_cache_size: 0,
      ..config
   });
   t.conn.execute_for_long("SELECT 1", &[], None).unwrap();
   assert!(t.conn.statement_cache().cached_sql().is_empty());
   assert_eq!(t.conn.statement_cache().live_statements(), 0);
}

#[test]
fn test_reentrant_call_with_same_sql_compiles_uncached_copy() {
   const SQL: &str = "SELECT reenter()";
   let dir = tempfile::tempdir().unwrap();
   let slot: Arc<OnceLock<Weak<Connection>>> = Arc::new(OnceLock::new());
   let entered = Arc::new(AtomicBool::new(false));
   let in_use_seen = Arc::new(AtomicUsize::new(0));

   let function = {
      let slot = Arc::clone(&slot);
      let entered = Arc::clone(&entered);
      let in_use_seen = Arc::clone(&in_use_seen);
      CustomFunction::new("reenter", 0, move |_| {
         let conn = slot
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| "connection gone".to_string())?;
         if entered.swap(true, Ordering::SeqCst) {
            in_use_seen.store(conn.statement_cache().in_use_count(SQL), Ordering::SeqCst);
            return Ok(Value::Integer(7));
         }
         let inner = conn.execute_for_long(SQL, &[], None).map_err(|e| e.to_string())?;
         Ok(Value::from(inner))
      })
   };

   let config = config_in(&dir).with_function(function);
   let conn = Arc::new(Connection::connect(config, "default", Arc::new(OperationLog::new("test-app"))).unwrap());
   slot.set(Arc::downgrade(&conn)).unwrap();

   assert_eq!(conn.execute_for_long(SQL, &[], None).unwrap(), Some(7));
   // The cached statement and a fresh uncached one were both in use.
   assert_eq!(in_use_seen.load(Ordering::SeqCst), 2);

   let cache = conn.statement_cache();
   assert_eq!(cache.in_use_count(SQL), 0);
   assert!(cache.contains(SQL));
   assert_eq!(cache.live_statements(), 1);
}

// ============================================================================
// Binding and Execution
// ============================================================================

#[test]
fn test_bind_count_mismatch_performs_no_execution() {
   let t = open_default();
   let conn = &t.conn;
   create_items(conn, 0);

   let result = conn.execute("INSERT INTO items (id, name) VALUES (?, ?)", &[Value::from(1)], None);
   assert!(matches!(
      result,
      Err(Error::BindArgumentCount {
         expected: 2,
         actual: 1
      })
   ));

   let op = &t.log.recent_operations()[0];
   assert_eq!(op.engine_calls, 0);
   assert!(!op.succeeded());
   assert_eq!(conn.execute_for_long("SELECT count(*) FROM items", &[], None).unwrap(), Some(0));
}

#[test]
fn test_empty_sql_is_rejected() {
   let t = open_default();
   assert!(matches!(t.conn.execute("   ", &[], None), Err(Error::InvalidArgument(_))));
   assert!(matches!(t.conn.prepare("", None), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_scalar_and_row_count_variants() {
   let t = open_default();
   let conn = &t.conn;
   create_items(conn, 3);

   let id = conn
      .execute_for_last_inserted_row_id("INSERT INTO items (name) VALUES (?)", &[Value::from("x")], None)
      .unwrap();
   assert_eq!(id, 3);

   let changed = conn
      .execute_for_changed_row_count("UPDATE items SET name = 'y' WHERE id < ?", &[Value::from(2)], None)
      .unwrap();
   assert_eq!(changed, 2);
   assert_eq!(t.log.recent_operations()[0].detail.as_deref(), Some("changedRows=2"));

   assert_eq!(
      conn.execute_for_string("SELECT name FROM items WHERE id = 0", &[], None).unwrap().as_deref(),
      Some("y")
   );
   assert_eq!(conn.execute_for_long("SELECT id FROM items WHERE id = 99", &[], None).unwrap(), None);

   let none_inserted = conn
      .execute_for_last_inserted_row_id("INSERT INTO items (id, name) SELECT 1, 'z' WHERE 0", &[], None)
      .unwrap();
   assert_eq!(none_inserted, -1);
}

#[test]
fn test_blob_and_null_round_trip() {
   let t = open_default();
   let conn = &t.conn;
   conn.execute("CREATE TABLE b (data BLOB, note TEXT)", &[], None).unwrap();
   conn
      .execute("INSERT INTO b VALUES (?, ?)", &[Value::Blob(vec![0, 1, 2]), Value::Null], None)
      .unwrap();
   conn.execute("INSERT INTO b VALUES (?, ?)", &[Value::Blob(Vec::new()), Value::from("e")], None).unwrap();

   let rows = conn.execute_for_rows("SELECT data, note FROM b ORDER BY rowid", &[], None).unwrap();
   assert_eq!(rows.columns, vec!["data".to_string(), "note".to_string()]);
   assert_eq!(rows.rows[0], vec![Value::Blob(vec![0, 1, 2]), Value::Null]);
   assert_eq!(rows.rows[1], vec![Value::Blob(Vec::new()), Value::Text("e".into())]);
}

#[test]
fn test_engine_error_is_logged_and_propagated() {
   let t = open_default();
   let conn = &t.conn;
   create_items(conn, 1);

   let err = conn
      .execute("INSERT INTO items (id, name) VALUES (?, ?)", &[Value::from(0), Value::from("dup")], None)
      .unwrap_err();
   assert_eq!(err.error_code(), "SQLITE_CONSTRAINT");

   let op = &t.log.recent_operations()[0];
   assert!(op.error.as_deref().unwrap().contains("UNIQUE"));
   assert_eq!(op.engine_calls, 1);

   // The statement survives the failure and is reused.
   conn
      .execute("INSERT INTO items (id, name) VALUES (?, ?)", &[Value::from(1), Value::from("ok")], None)
      .unwrap();
   assert!(conn.statement_cache().contains("INSERT INTO items (id, name) VALUES (?, ?)"));
}

#[test]
fn test_prepare_reports_metadata() {
   let t = open_default();
   let conn = &t.conn;
   create_items(conn, 0);

   let info = conn.prepare("SELECT id, name FROM items WHERE id > ?", None).unwrap();
   assert_eq!(info.num_parameters, 1);
   assert!(info.read_only);
   assert_eq!(info.column_names, vec!["id".to_string(), "name".to_string()]);

   let info = conn.prepare("DELETE FROM items", None).unwrap();
   assert!(!info.read_only);
   assert!(info.column_names.is_empty());
}

#[test]
fn test_syntax_error_from_prepare() {
   let t = open_default();
   let err = t.conn.execute("SELEC 1", &[], None).unwrap_err();
   assert_eq!(err.error_code(), "SQLITE_ERROR");
   assert_eq!(t.conn.statement_cache().live_statements(), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_pre_canceled_signal_fails_without_engine_call() {
   let t = open_default();
   let signal = CancellationSignal::new();
   signal.cancel();

   let result = t.conn.execute_for_long("SELECT 1", &[], Some(&signal));
   assert!(matches!(result, Err(Error::Canceled)));

   let op = &t.log.recent_operations()[0];
   assert_eq!(op.sql, "SELECT 1");
   assert_eq!(op.engine_calls, 0);
}

#[test]
fn test_cancel_interrupts_running_query() {
   let t = open_default();
   let signal = CancellationSignal::new();
   let canceler = {
      let signal = signal.clone();
      thread::spawn(move || {
         thread::sleep(Duration::from_millis(100));
         signal.cancel();
      })
   };

   let result = t.conn.execute_for_long(
      "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 10000000000) SELECT count(*) FROM c",
      &[],
      Some(&signal),
   );
   canceler.join().unwrap();
   assert!(matches!(result, Err(Error::Canceled)));

   // The connection remains usable and cancellation is disarmed.
   let other = CancellationSignal::new();
   assert_eq!(t.conn.execute_for_long("SELECT 5", &[], Some(&other)).unwrap(), Some(5));
}

// ============================================================================
// Cursor Window
// ============================================================================

#[test]
fn test_window_fill_counts_all_rows() {
   let t = open_default();
   let conn = &t.conn;
   create_items(conn, 100);
   let sql = "SELECT id, name FROM items ORDER BY id";

   let mut window = CursorWindow::with_row_limit("items", 10);
   let counted = conn.execute_for_cursor_window(sql, &[], &mut window, 0, 0, true, None).unwrap();
   assert_eq!(counted, 100);
   assert_eq!(window.start_position(), 0);
   assert_eq!(window.num_rows(), 10);
   assert_eq!(window.num_columns(), 2);
   assert_eq!(window.value(9, 0), Some(&Value::Integer(9)));
}

#[test]
fn test_window_fill_from_start_position() {
   let t = open_default();
   let conn = &t.conn;
   create_items(conn, 100);
   let sql = "SELECT id FROM items ORDER BY id";

   let mut window = CursorWindow::with_row_limit("items", 10);
   conn.execute_for_cursor_window(sql, &[], &mut window, 45, 50, false, None).unwrap();
   assert_eq!(window.start_position(), 45);
   assert!(window.contains_position(50));
   assert_eq!(window.value(54, 0), Some(&Value::Integer(54)));
   assert!(!window.contains_position(55));
}

#[test]
fn test_window_restarts_until_required_row_fits() {
   let t = open_default();
   let conn = &t.conn;
   create_items(conn, 100);
   let sql = "SELECT id FROM items ORDER BY id";

   let mut window = CursorWindow::with_row_limit("items", 10);
   conn.execute_for_cursor_window(sql, &[], &mut window, 0, 25, false, None).unwrap();
   assert_eq!(window.start_position(), 20);
   assert!(window.contains_position(25));
   assert_eq!(window.value(25, 0), Some(&Value::Integer(25)));

   let op = &t.log.recent_operations()[0];
   assert!(op.detail.as_deref().unwrap().contains("actualPos=20"));
}

#[test]
fn test_window_cleared_on_failure() {
   let t = open_default();
   let conn = &t.conn;
   create_items(conn, 5);

   let mut window = CursorWindow::with_row_limit("items", 10);
   conn
      .execute_for_cursor_window("SELECT id FROM items", &[], &mut window, 0, 0, true, None)
      .unwrap();
   assert_eq!(window.num_rows(), 5);

   let result = conn.execute_for_cursor_window("SELECT nope FROM items", &[], &mut window, 0, 0, true, None);
   assert!(result.is_err());
   assert_eq!(window.num_rows(), 0);
}

// ============================================================================
// Lifecycle and Diagnostics
// ============================================================================

#[test]
fn test_dispose_is_idempotent() {
   let t = open_default();
   t.conn.execute_for_long("SELECT 1", &[], None).unwrap();

   t.conn.dispose();
   t.conn.dispose();

   assert!(!t.conn.is_open());
   assert!(matches!(t.conn.execute("SELECT 1", &[], None), Err(Error::ConnectionClosed)));
   assert_eq!(t.conn.statement_cache().live_statements(), 0);
   assert_eq!(t.log.active_connections(), 0);
}

#[test]
fn test_version_and_integrity() {
   let t = open_default();
   assert_eq!(t.conn.get_version().unwrap(), 0);
   t.conn.set_version(4).unwrap();
   assert_eq!(t.conn.get_version().unwrap(), 4);
   assert!(t.conn.is_database_integrity_ok().unwrap());
}

#[test]
fn test_verbose_dump() {
   let t = open_default();
   t.conn.execute_for_long("SELECT\n   1", &[], None).unwrap();

   let mut dump = String::new();
   t.conn.dump(&mut dump, true);
   assert!(dump.contains("sessionQualifier: default"));
   assert!(dump.contains("connectionPtr: 0x"));
   assert!(dump.contains("lookaside: "));
   assert!(dump.contains("preparedStatementCache hitCount: "));
   assert!(dump.contains("0: statementPtr=0x"));
   assert!(dump.contains("type=SELECT, readOnly=true, sql=\"SELECT 1\""));
}

#[test]
fn test_reopen_existing_database() {
   let dir = tempfile::tempdir().unwrap();
   let log = Arc::new(OperationLog::new("test-app"));
   {
      let conn = Connection::connect(config_in(&dir), "first", Arc::clone(&log)).unwrap();
      create_items(&conn, 2);
      conn.dispose();
   }
   let conn = Connection::connect(config_in(&dir), "second", Arc::clone(&log)).unwrap();
   assert_eq!(conn.execute_for_long("SELECT count(*) FROM items", &[], None).unwrap(), Some(2));
   assert_eq!(log.active_connections(), 1);
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLogs {
   fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
   }

   fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
   }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
   type Writer = CapturedLogs;

   fn make_writer(&'a self) -> Self::Writer {
      self.clone()
   }
}

#[test]
fn test_leaked_connection_is_closed_with_warning() {
   let dir = tempfile::tempdir().unwrap();
   let log = Arc::new(OperationLog::new("test-app"));
   let logs = CapturedLogs::default();
   let subscriber = tracing_subscriber::fmt()
      .with_writer(logs.clone())
      .with_ansi(false)
      .finish();

   tracing::subscriber::with_default(subscriber, || {
      let conn = Connection::connect(config_in(&dir), "leaky", Arc::clone(&log)).unwrap();
      conn.execute_for_long("SELECT 1", &[], None).unwrap();
      drop(conn);
   });

   assert_eq!(log.active_connections(), 0);
   let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
   assert!(output.contains("A connection was leaked!"));
}
