//! A single owned SQLite connection.
//!
//! Every public operation follows the same template: validate the SQL, take
//! the connection mutex, open an operation-log entry, check a statement out of
//! the cache, bind, arm cancellation, run the engine, then release the
//! statement and close the log entry. The mutex is reentrant because custom
//! SQL functions may call back into the connection from inside a step.

use parking_lot::ReentrantMutex;
use std::cell::{Cell, RefCell};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::cache::{AcquiredStatement, CacheStats, PreparedStatementCache};
use crate::cancellation::{CancelListener, CancellationSignal, InterruptFlag};
use crate::config::{DatabaseConfig, OpenFlags};
use crate::error::{Error, Result};
use crate::native::{NativeConnection, NativeStatement, Step};
use crate::operation_log::OperationLog;
use crate::statement::StatementInfo;
use crate::value::Value;
use crate::window::CursorWindow;

/// Fully materialized query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
   pub columns: Vec<String>,
   pub rows: Vec<Vec<Value>>,
}

impl Rows {
   pub fn len(&self) -> usize {
      self.rows.len()
   }

   pub fn is_empty(&self) -> bool {
      self.rows.is_empty()
   }

   pub fn column_index(&self, name: &str) -> Option<usize> {
      self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
   }
}

struct ConnectionState {
   native: RefCell<Option<NativeConnection>>,
   cancellation_attach_count: Cell<u32>,
}

/// What a running operation may touch besides its own statement.
struct Execution<'a> {
   native: &'a NativeConnection,
   statement: &'a NativeStatement,
   cookie: u32,
}

/// One SQLite connection with its own statement cache.
///
/// The native handle is reachable only through this type and only while the
/// connection mutex is held. A closed connection fails every operation with
/// [`Error::ConnectionClosed`].
pub struct Connection {
   config: DatabaseConfig,
   label: String,
   session_qualifier: String,
   operation_log: Arc<OperationLog>,
   cache: PreparedStatementCache,
   interrupt: Arc<InterruptFlag>,
   state: ReentrantMutex<ConnectionState>,
}

impl Connection {
   /// Creates a closed connection. Call [`open`](Self::open) to attach the database.
   pub fn new(
      config: DatabaseConfig,
      session_qualifier: impl Into<String>,
      operation_log: Arc<OperationLog>,
   ) -> Result<Self> {
      config.validate()?;
      Ok(Self {
         label: config.label(),
         cache: PreparedStatementCache::new(config.max_sql_cache_size),
         config,
         session_qualifier: session_qualifier.into(),
         operation_log,
         interrupt: Arc::new(InterruptFlag::default()),
         state: ReentrantMutex::new(ConnectionState {
            native: RefCell::new(None),
            cancellation_attach_count: Cell::new(0),
         }),
      })
   }

   /// Creates and opens a connection.
   pub fn connect(
      config: DatabaseConfig,
      session_qualifier: impl Into<String>,
      operation_log: Arc<OperationLog>,
   ) -> Result<Self> {
      let connection = Self::new(config, session_qualifier, operation_log)?;
      connection.open()?;
      Ok(connection)
   }

   /// Opens the database and applies the connection pragmas.
   ///
   /// WAL is mandatory. Locking and journal modes that refuse to change are
   /// fatal; on any failure the half-open handle is disposed before returning.
   pub fn open(&self) -> Result<()> {
      if !self.config.open_flags.contains(OpenFlags::ENABLE_WRITE_AHEAD_LOGGING) {
         return Err(Error::WalRequired);
      }

      let state = self.state.lock();
      if state.native.borrow().is_some() {
         return Ok(());
      }

      self.operation_log.tick_open();
      let native = match NativeConnection::open(
         &self.config.path,
         self.config.open_flags,
         &self.label,
         self.config.pragmas.busy_timeout_ms,
         Arc::clone(&self.interrupt),
      ) {
         Ok(native) => native,
         Err(e) => {
            self.operation_log.tick_close();
            return Err(e);
         }
      };

      for function in &self.config.custom_functions {
         if let Err(e) = native.register_function(function) {
            self.operation_log.tick_close();
            let _ = native.close();
            return Err(e);
         }
      }

      *state.native.borrow_mut() = Some(native);
      debug!(app = %self.config.app_name, session = %self.session_qualifier, label = %self.label, "Opened connection");

      if let Err(e) = self.configure() {
         error!(app = %self.config.app_name, label = %self.label, error = %e, "Failed to configure connection");
         drop(state);
         self.dispose_inner(false);
         return Err(e);
      }
      Ok(())
   }

   fn configure(&self) -> Result<()> {
      let pragmas = &self.config.pragmas;
      self.ensure_long_pragma("page_size", pragmas.page_size)?;
      self.ensure_long_pragma(
         "foreign_keys",
         i64::from(self.config.foreign_key_constraints_enabled),
      )?;
      self.ensure_long_pragma("journal_size_limit", pragmas.journal_size_limit)?;
      self.ensure_long_pragma("wal_autocheckpoint", pragmas.wal_autocheckpoint)?;
      self.ensure_mode("locking_mode", "NORMAL")?;
      self.ensure_mode("journal_mode", "WAL")?;
      self.ensure_sync_mode(&pragmas.wal_sync_mode)?;
      self.verify_busy_timeout(pragmas.busy_timeout_ms)
   }

   fn ensure_long_pragma(&self, pragma: &str, desired: i64) -> Result<()> {
      let value = self.execute_for_long(&format!("PRAGMA {pragma}"), &[], None)?;
      if value != Some(desired) {
         self.execute(&format!("PRAGMA {pragma}={desired}"), &[], None)?;
      }
      Ok(())
   }

   /// Sets a mode pragma that reports its effective value back.
   fn ensure_mode(&self, pragma: &'static str, desired: &str) -> Result<()> {
      let value = self
         .execute_for_string(&format!("PRAGMA {pragma}"), &[], None)?
         .unwrap_or_default();
      if value.eq_ignore_ascii_case(desired) {
         return Ok(());
      }

      let result = self
         .execute_for_string(&format!("PRAGMA {pragma}={desired}"), &[], None)?
         .unwrap_or_default();
      if result.eq_ignore_ascii_case(desired) {
         return Ok(());
      }

      // These pragmas fail silently, returning the old value, when another
      // connection holds the database.
      error!(
         app = %self.config.app_name,
         label = %self.label,
         pragma,
         from = %value,
         to = desired,
         "Could not change the database mode"
      );
      Err(Error::PragmaNotChanged {
         pragma,
         from: value,
         to: desired.to_string(),
      })
   }

   fn ensure_sync_mode(&self, desired: &str) -> Result<()> {
      let value = self
         .execute_for_string("PRAGMA synchronous", &[], None)?
         .unwrap_or_default();
      if !canonicalize_sync_mode(&value).eq_ignore_ascii_case(canonicalize_sync_mode(desired)) {
         self.execute(&format!("PRAGMA synchronous={desired}"), &[], None)?;
      }
      Ok(())
   }

   /// Reports a busy-timeout mismatch without correcting it.
   fn verify_busy_timeout(&self, desired: i64) -> Result<()> {
      let value = self.execute_for_long("PRAGMA busy_timeout", &[], None)?;
      if value != Some(desired) {
         warn!(app = %self.config.app_name, label = %self.label, expected = desired, actual = ?value, "busy_timeout differs from the configured value");
      }
      Ok(())
   }

   pub fn is_open(&self) -> bool {
      self.state.lock().native.borrow().is_some()
   }

   /// Runs `f` with the connection mutex held.
   ///
   /// Calls made from `f` on this thread reenter the mutex. Callers that guard
   /// their own state around SQL take this first, so the connection mutex is
   /// always acquired before any lock of theirs.
   pub fn run_locked<T>(&self, f: impl FnOnce() -> T) -> T {
      let _state = self.state.lock();
      f()
   }

   pub fn config(&self) -> &DatabaseConfig {
      &self.config
   }

   pub fn label(&self) -> &str {
      &self.label
   }

   pub fn session_qualifier(&self) -> &str {
      &self.session_qualifier
   }

   pub fn operation_log(&self) -> &Arc<OperationLog> {
      &self.operation_log
   }

   /// Cache counters. Only takes the cache lock, so it never waits on running SQL.
   pub fn cache_stats(&self) -> CacheStats {
      self.cache.stats()
   }

   pub fn statement_cache(&self) -> &PreparedStatementCache {
      &self.cache
   }

   /// Compiles `sql` and reports its metadata without executing it.
   pub fn prepare(&self, sql: &str, cancel: Option<&CancellationSignal>) -> Result<StatementInfo> {
      validate_sql(sql)?;
      if let Some(signal) = cancel {
         signal.throw_if_canceled()?;
      }

      let state = self.state.lock();
      let native_slot = state.native.borrow();
      let native = native_slot.as_ref().ok_or(Error::ConnectionClosed)?;

      let cookie = self.operation_log.begin_operation(&self.session_qualifier, "prepare", sql, &[]);
      let result = self.cache.acquire(native, sql).map(|statement| {
         let info = StatementInfo {
            num_parameters: statement.num_parameters,
            read_only: statement.read_only,
            column_names: statement.native.column_names(),
         };
         self.cache.release(statement);
         info
      });
      self.finish_operation(cookie, result)
   }

   /// Runs `sql`, discarding any rows it produces.
   pub fn execute(&self, sql: &str, args: &[Value], cancel: Option<&CancellationSignal>) -> Result<()> {
      self.run("execute", sql, args, cancel, |exec| {
         while exec.statement.step()? == Step::Row {}
         Ok(())
      })
   }

   /// First column of the first row as an integer, `None` when there is no row.
   pub fn execute_for_long(
      &self,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
   ) -> Result<Option<i64>> {
      self.run("executeForLong", sql, args, cancel, |exec| {
         Ok(first_value(exec.statement)?.and_then(|v| v.as_integer()))
      })
   }

   /// First column of the first row as text, `None` when there is no row or it is NULL.
   pub fn execute_for_string(
      &self,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
   ) -> Result<Option<String>> {
      self.run("executeForString", sql, args, cancel, |exec| {
         Ok(first_value(exec.statement)?.and_then(|v| v.to_text()))
      })
   }

   /// Runs a data-changing statement and returns the number of rows it changed.
   pub fn execute_for_changed_row_count(
      &self,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
   ) -> Result<i64> {
      self.run("executeForChangedRowCount", sql, args, cancel, |exec| {
         while exec.statement.step()? == Step::Row {}
         let changed = exec.native.changes()?;
         self.operation_log.set_detail(exec.cookie, format!("changedRows={changed}"));
         Ok(changed)
      })
   }

   /// Runs an insert and returns the new row id, or -1 if nothing was inserted.
   pub fn execute_for_last_inserted_row_id(
      &self,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
   ) -> Result<i64> {
      self.run("executeForLastInsertedRowId", sql, args, cancel, |exec| {
         while exec.statement.step()? == Step::Row {}
         if exec.native.changes()? > 0 {
            exec.native.last_insert_rowid()
         } else {
            Ok(-1)
         }
      })
   }

   /// Runs a query and returns every row.
   pub fn execute_for_rows(
      &self,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
   ) -> Result<Rows> {
      self.run("executeForRows", sql, args, cancel, |exec| {
         let mut rows = Rows {
            columns: exec.statement.column_names(),
            rows: Vec::new(),
         };
         while exec.statement.step()? == Step::Row {
            rows.rows.push(exec.statement.read_row());
         }
         Ok(rows)
      })
   }

   /// Fills `window` with rows of `sql` starting at or before `required_pos`.
   ///
   /// Rows before `start_pos` are skipped. If the window fills up before
   /// `required_pos` is reached, it is emptied and filling restarts at the
   /// current row, so the required row always lands in the window when it
   /// fits. With `count_all_rows` every row is stepped and the total is
   /// returned; otherwise stepping stops once the window is full and the
   /// return value is one past the last row examined. The window's start
   /// position is set to the first row actually placed in it.
   ///
   /// On failure the window is cleared.
   #[allow(clippy::too_many_arguments)]
   pub fn execute_for_cursor_window(
      &self,
      sql: &str,
      args: &[Value],
      window: &mut CursorWindow,
      start_pos: usize,
      required_pos: usize,
      count_all_rows: bool,
      cancel: Option<&CancellationSignal>,
   ) -> Result<usize> {
      let result = self.run("executeForCursorWindow", sql, args, cancel, |exec| {
         let (actual_pos, counted) = fill_window(exec.statement, window, start_pos, required_pos, count_all_rows)?;
         window.set_start_position(actual_pos);
         self.operation_log.set_detail(
            exec.cookie,
            format!(
               "window='{}', startPos={start_pos}, actualPos={actual_pos}, filledRows={}, countedRows={counted}",
               window.name(),
               window.num_rows(),
            ),
         );
         Ok(counted)
      });
      if result.is_err() {
         window.clear();
      }
      result
   }

   /// True if `PRAGMA main.integrity_check(1)` reports `ok`.
   pub fn is_database_integrity_ok(&self) -> Result<bool> {
      let result = self.execute_for_string("PRAGMA main.integrity_check(1);", &[], None)?;
      Ok(result.is_some_and(|r| r.eq_ignore_ascii_case("ok")))
   }

   /// The database's `user_version`.
   pub fn get_version(&self) -> Result<i64> {
      Ok(self.execute_for_long("PRAGMA user_version;", &[], None)?.unwrap_or(0))
   }

   pub fn set_version(&self, version: i64) -> Result<()> {
      self.execute(&format!("PRAGMA user_version = {version};"), &[], None)
   }

   /// Requests cancellation of the running operation. Never blocks.
   pub fn on_cancel(&self) {
      self.interrupt.on_cancel();
   }

   /// Lookaside slots in use, or 0 when closed.
   pub fn lookaside_used(&self) -> i32 {
      let state = self.state.lock();
      state.native.borrow().as_ref().map_or(0, NativeConnection::lookaside_used)
   }

   /// Closes the connection. Safe to call any number of times.
   pub fn dispose(&self) {
      self.dispose_inner(false);
   }

   fn dispose_inner(&self, finalized: bool) {
      let state = self.state.lock();
      let native = match state.native.try_borrow_mut() {
         Ok(mut slot) => slot.take(),
         Err(_) => {
            warn!(app = %self.config.app_name, label = %self.label, "Cannot dispose a connection from inside one of its own operations");
            return;
         }
      };
      let Some(native) = native else {
         return;
      };

      if finalized {
         warn!(
            app = %self.config.app_name,
            session = %self.session_qualifier,
            label = %self.label,
            "A connection was leaked! Close connections when they are no longer needed."
         );
      }

      self.cache.finalize_all();
      self.operation_log.tick_close();
      if let Err(e) = native.close() {
         warn!(app = %self.config.app_name, label = %self.label, error = %e, "Error while closing connection");
      }
      debug!(app = %self.config.app_name, session = %self.session_qualifier, label = %self.label, "Closed connection");
   }

   /// Appends a human-readable description of the connection to `out`.
   ///
   /// Uses `try_lock` so a dump never waits behind a running query.
   pub fn dump(&self, out: &mut String, verbose: bool) {
      let _ = writeln!(
         out,
         "Connection '{}' sessionQualifier: {}",
         self.label, self.session_qualifier
      );
      if verbose {
         match self.state.try_lock() {
            Some(state) => {
               let native = state.native.borrow();
               let address = native.as_ref().map_or(0, NativeConnection::address);
               let lookaside = native.as_ref().map_or(0, NativeConnection::lookaside_used);
               let _ = writeln!(out, "  connectionPtr: 0x{address:x}");
               let _ = writeln!(out, "  lookaside: {lookaside}");
            }
            None => {
               let _ = writeln!(out, "  connectionPtr: <busy>");
            }
         }
         let stats = self.cache.stats();
         let _ = writeln!(
            out,
            "  preparedStatementCache hitCount: {} missCount: {} size: {}",
            stats.hit_count, stats.miss_count, stats.size
         );
      }
      self.cache.dump(out);
   }

   /// The shared operation template.
   fn run<T>(
      &self,
      kind: &'static str,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
      f: impl FnOnce(&Execution<'_>) -> Result<T>,
   ) -> Result<T> {
      validate_sql(sql)?;

      let state = self.state.lock();
      let native_slot = state.native.borrow();
      let native = native_slot.as_ref().ok_or(Error::ConnectionClosed)?;

      let cookie = self.operation_log.begin_operation(&self.session_qualifier, kind, sql, args);
      let result = match self.cache.acquire(native, sql) {
         Ok(statement) => {
            let result = self.bind_and_run(&state, native, &statement, cookie, args, cancel, f);
            self.cache.release(statement);
            result
         }
         Err(e) => Err(e),
      };
      self.finish_operation(cookie, result)
   }

   #[allow(clippy::too_many_arguments)]
   fn bind_and_run<T>(
      &self,
      state: &ConnectionState,
      native: &NativeConnection,
      statement: &AcquiredStatement,
      cookie: u32,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
      f: impl FnOnce(&Execution<'_>) -> Result<T>,
   ) -> Result<T> {
      if args.len() != statement.num_parameters {
         return Err(Error::BindArgumentCount {
            expected: statement.num_parameters,
            actual: args.len(),
         });
      }
      statement.native.bind_all(args)?;

      self.attach_cancellation(state, native, cancel)?;
      self.operation_log.note_engine_call(cookie);
      let result = f(&Execution {
         native,
         statement: &statement.native,
         cookie,
      });
      self.detach_cancellation(state, native, cancel);
      result
   }

   fn finish_operation<T>(&self, cookie: u32, result: Result<T>) -> Result<T> {
      if let Err(e) = &result {
         self.operation_log.fail_operation(cookie, e);
      }
      self.operation_log.end_operation(cookie);
      result
   }

   fn attach_cancellation(
      &self,
      state: &ConnectionState,
      native: &NativeConnection,
      cancel: Option<&CancellationSignal>,
   ) -> Result<()> {
      let Some(signal) = cancel else {
         return Ok(());
      };
      signal.throw_if_canceled()?;

      let count = state.cancellation_attach_count.get() + 1;
      state.cancellation_attach_count.set(count);
      if count == 1 {
         native.reset_cancel(true);
         let listener: Arc<dyn CancelListener> = Arc::clone(&self.interrupt) as Arc<dyn CancelListener>;
         signal.set_on_cancel_listener(Some(listener));
      }
      Ok(())
   }

   fn detach_cancellation(
      &self,
      state: &ConnectionState,
      native: &NativeConnection,
      cancel: Option<&CancellationSignal>,
   ) {
      let Some(signal) = cancel else {
         return;
      };

      let count = state.cancellation_attach_count.get();
      if count == 0 {
         warn!(app = %self.config.app_name, label = %self.label, "Cancellation detached more often than attached");
         return;
      }
      state.cancellation_attach_count.set(count - 1);
      if count == 1 {
         signal.set_on_cancel_listener(None);
         native.reset_cancel(false);
      }
   }
}

impl Drop for Connection {
   fn drop(&mut self) {
      self.dispose_inner(true);
   }
}

fn validate_sql(sql: &str) -> Result<()> {
   if sql.trim().is_empty() {
      return Err(Error::InvalidArgument("sql must not be empty".into()));
   }
   Ok(())
}

fn first_value(statement: &NativeStatement) -> Result<Option<Value>> {
   if statement.step()? == Step::Row && statement.column_count() > 0 {
      return Ok(Some(statement.column_value(0)));
   }
   Ok(None)
}

/// Steps `statement` into `window`. Returns `(actual_start, counted_rows)`.
fn fill_window(
   statement: &NativeStatement,
   window: &mut CursorWindow,
   start_pos: usize,
   required_pos: usize,
   count_all_rows: bool,
) -> Result<(usize, usize)> {
   window.clear();
   window.set_num_columns(statement.column_count());

   let mut total = 0;
   let mut start = start_pos;
   let mut room = true;
   while statement.step()? == Step::Row {
      if total >= start && room {
         room = window.push_row(statement.read_row());
         if !room && total <= required_pos {
            // Full before the required row: restart the window here.
            window.clear_rows();
            start = total;
            room = window.push_row(statement.read_row());
         }
         if !room && !count_all_rows {
            break;
         }
      }
      total += 1;
   }

   statement.reset_and_clear()?;
   Ok((start, total))
}

fn canonicalize_sync_mode(value: &str) -> &str {
   match value {
      "0" => "OFF",
      "1" => "NORMAL",
      "2" => "FULL",
      "3" => "EXTRA",
      other => other,
   }
}
