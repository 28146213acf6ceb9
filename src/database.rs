//! Session façade over a single connection.
//!
//! A [`Database`] adds reference counting, a nested transaction stack and an
//! initialization gate to a [`Connection`]. Raw `BEGIN`, `COMMIT`/`END` and
//! `ROLLBACK` text passed to any `execute*` method is routed through the
//! structured transaction methods so the stack always matches the engine.
//!
//! Two locks are involved. The shared-state lock guards configuration, the
//! connection handle and the reference count, and is never held while SQL
//! runs. The transaction lock is reentrant and is held for the whole of a
//! begin or end, listener hooks included. Whenever both the transaction lock
//! and the connection mutex are needed, the connection mutex is taken first.

use std::cell::RefCell;
use std::fmt::{self, Write};
use std::sync::Arc;

use odk_sqlite_conn::{
   CancellationSignal, Connection, CursorWindow, DatabaseConfig, OperationLog, Rows, StatementInfo,
   StatementKind, Value,
};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use tracing::{debug, error, warn};

use crate::cursor::Cursor;
use crate::query::{self, ConflictAlgorithm, ContentValues, Query};
use crate::transactions::{TransactionListener, TransactionMode, TransactionStack};
use crate::{Error, Result};

struct SharedState {
   config: DatabaseConfig,
   connection: Option<Arc<Connection>>,
   references: u32,
   closed: bool,
}

/// Holds one reference for the duration of an operation.
struct ReferenceGuard<'a>(&'a Database);

impl Drop for ReferenceGuard<'_> {
   fn drop(&mut self) {
      self.0.release_reference();
   }
}

/// A session on one database file.
///
/// Created with one reference owned by the caller; [`close`](Self::close)
/// releases it. Every operation holds its own reference while it runs, so the
/// connection is disposed only after the last operation or
/// [`Cursor`] lets go.
pub struct Database {
   app_name: String,
   session_qualifier: String,
   label: String,
   operation_log: Arc<OperationLog>,
   shared: Mutex<SharedState>,
   transactions: ReentrantMutex<RefCell<TransactionStack>>,
   initialization: Mutex<Option<bool>>,
   initialized: Condvar,
}

impl Database {
   /// Creates a session whose connection has not been opened yet.
   ///
   /// Use [`open_connection`](Self::open_connection) to attach the file, or
   /// [`open`](Self::open) to do both.
   pub fn new(
      config: DatabaseConfig,
      session_qualifier: impl Into<String>,
      operation_log: Arc<OperationLog>,
   ) -> Result<Arc<Self>> {
      let session_qualifier = session_qualifier.into();
      let connection = Connection::new(config.clone(), session_qualifier.clone(), Arc::clone(&operation_log))?;
      Ok(Arc::new(Self {
         app_name: config.app_name.clone(),
         label: config.label(),
         session_qualifier,
         operation_log,
         shared: Mutex::new(SharedState {
            config,
            connection: Some(Arc::new(connection)),
            references: 1,
            closed: false,
         }),
         transactions: ReentrantMutex::new(RefCell::new(TransactionStack::default())),
         initialization: Mutex::new(None),
         initialized: Condvar::new(),
      }))
   }

   /// Creates a session, opens its connection and marks it initialized.
   pub fn open(
      config: DatabaseConfig,
      session_qualifier: impl Into<String>,
      operation_log: Arc<OperationLog>,
   ) -> Result<Arc<Self>> {
      let database = Self::new(config, session_qualifier, operation_log)?;
      if let Err(e) = database.open_connection() {
         database.signal_initialization_complete(false);
         database.close();
         return Err(e);
      }
      database.signal_initialization_complete(true);
      Ok(database)
   }

   /// Opens the underlying connection.
   pub fn open_connection(&self) -> Result<()> {
      self.with_connection(|connection| Ok(connection.open()?))?;
      debug!(app = %self.app_name, session = %self.session_qualifier, label = %self.label, "Opened session");
      Ok(())
   }

   pub fn app_name(&self) -> &str {
      &self.app_name
   }

   pub fn session_qualifier(&self) -> &str {
      &self.session_qualifier
   }

   pub fn label(&self) -> &str {
      &self.label
   }

   pub fn operation_log(&self) -> &Arc<OperationLog> {
      &self.operation_log
   }

   /// True while the connection is attached and not yet disposed.
   pub fn is_open(&self) -> bool {
      let connection = self.shared.lock().connection.clone();
      connection.is_some_and(|connection| connection.is_open())
   }

   /// Snapshot of the session's configuration.
   pub fn config(&self) -> DatabaseConfig {
      self.shared.lock().config.clone()
   }

   // ---------------------------------------------------------------------
   // References and lifetime
   // ---------------------------------------------------------------------

   /// Adds a reference. Fails once the last reference has been released.
   pub fn acquire_reference(&self) -> Result<()> {
      let mut shared = self.shared.lock();
      if shared.references == 0 {
         return Err(Error::ObjectClosed(self.label.clone()));
      }
      shared.references += 1;
      Ok(())
   }

   /// Drops a reference, disposing the connection when none remain.
   pub fn release_reference(&self) {
      let dispose = {
         let mut shared = self.shared.lock();
         if shared.references == 0 {
            error!(app = %self.app_name, session = %self.session_qualifier, "Reference released on a session that has none");
            return;
         }
         shared.references -= 1;
         shared.references == 0
      };
      if dispose {
         self.dispose(false);
      }
   }

   pub fn reference_count(&self) -> u32 {
      self.shared.lock().references
   }

   /// Releases the reference taken when the session was created.
   ///
   /// Calling this more than once has no further effect.
   pub fn close(&self) {
      {
         let mut shared = self.shared.lock();
         if shared.closed {
            return;
         }
         shared.closed = true;
      }
      self.release_reference();
   }

   fn reference(&self) -> Result<ReferenceGuard<'_>> {
      self.acquire_reference()?;
      Ok(ReferenceGuard(self))
   }

   fn connection(&self) -> Result<Arc<Connection>> {
      self
         .shared
         .lock()
         .connection
         .clone()
         .ok_or_else(|| Error::ObjectClosed(self.label.clone()))
   }

   /// Runs `f` against the connection with a reference held and no lock taken.
   fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
      let _reference = self.reference()?;
      let connection = self.connection()?;
      f(&connection)
   }

   fn dispose(&self, finalized: bool) {
      let Some(connection) = self.shared.lock().connection.take() else {
         return;
      };

      if finalized {
         warn!(
            app = %self.app_name,
            session = %self.session_qualifier,
            label = %self.label,
            "A session was leaked! Close sessions when they are no longer needed."
         );
      }

      connection.run_locked(|| {
         let transactions = self.transactions.lock();
         let leaked = transactions.borrow_mut().clear();
         if leaked > 0 {
            error!(
               app = %self.app_name,
               session = %self.session_qualifier,
               depth = leaked,
               "Session closed with an open transaction; rolling back"
            );
            if let Err(e) = connection.execute("ROLLBACK;", &[], None) {
               warn!(app = %self.app_name, session = %self.session_qualifier, error = %e, "Rollback on close failed");
            }
         }
      });

      connection.dispose();
      debug!(app = %self.app_name, session = %self.session_qualifier, label = %self.label, "Closed session");
   }

   // ---------------------------------------------------------------------
   // Initialization gate
   // ---------------------------------------------------------------------

   /// Blocks until [`signal_initialization_complete`](Self::signal_initialization_complete)
   /// has been called and returns its outcome.
   pub fn wait_for_initialization_complete(&self) -> bool {
      let mut outcome = self.initialization.lock();
      while outcome.is_none() {
         self.initialized.wait(&mut outcome);
      }
      outcome.unwrap_or(false)
   }

   pub fn signal_initialization_complete(&self, success: bool) {
      *self.initialization.lock() = Some(success);
      self.initialized.notify_all();
   }

   // ---------------------------------------------------------------------
   // Transactions
   // ---------------------------------------------------------------------

   /// Begins a transaction, nesting inside any that is already open.
   ///
   /// Only the outermost begin reaches the engine. If the listener's
   /// `on_begin` fails, an outermost transaction is rolled back at once and
   /// no frame is pushed.
   pub fn begin_transaction(
      &self,
      mode: TransactionMode,
      listener: Option<Arc<dyn TransactionListener>>,
   ) -> Result<()> {
      self.begin_transaction_with_signal(mode, listener, None)
   }

   pub fn begin_transaction_exclusive(&self) -> Result<()> {
      self.begin_transaction(TransactionMode::Exclusive, None)
   }

   /// Begins a deferred transaction.
   pub fn begin_transaction_non_exclusive(&self) -> Result<()> {
      self.begin_transaction(TransactionMode::Deferred, None)
   }

   /// Like [`begin_transaction`](Self::begin_transaction); `cancel` may
   /// interrupt the native `BEGIN`.
   pub fn begin_transaction_with_signal(
      &self,
      mode: TransactionMode,
      listener: Option<Arc<dyn TransactionListener>>,
      cancel: Option<&CancellationSignal>,
   ) -> Result<()> {
      self.with_connection(|connection| {
         connection.run_locked(|| {
            let transactions = self.transactions.lock();
            if transactions.borrow().is_top_marked_successful() {
               return Err(Error::TransactionMarkedSuccessful);
            }

            let outermost = transactions.borrow().is_empty();
            if outermost {
               connection.execute(mode.begin_sql(), &[], cancel)?;
               debug!(app = %self.app_name, session = %self.session_qualifier, mode = %mode, "Began transaction");
            }

            if let Some(listener) = &listener
               && let Err(e) = listener.on_begin()
            {
               if outermost && let Err(rollback) = connection.execute("ROLLBACK;", &[], None) {
                  warn!(app = %self.app_name, session = %self.session_qualifier, error = %rollback, "Rollback after failed on_begin failed");
               }
               return Err(e);
            }

            transactions.borrow_mut().push(mode, listener);
            Ok(())
         })
      })
   }

   /// Marks the innermost transaction successful.
   pub fn set_transaction_successful(&self) -> Result<()> {
      let _reference = self.reference()?;
      let transactions = self.transactions.lock();
      let mut stack = transactions.borrow_mut();
      stack.mark_successful()
   }

   /// Ends the innermost transaction.
   ///
   /// It succeeds only if marked successful with no failed child. A nested
   /// failure is recorded on the parent; only the outermost end issues
   /// `COMMIT` or `ROLLBACK`. A listener error forces the rollback path and is
   /// returned after the frame has been popped.
   pub fn end_transaction(&self) -> Result<()> {
      self.end_transaction_with_signal(None)
   }

   /// Like [`end_transaction`](Self::end_transaction); `cancel` may interrupt
   /// the native `COMMIT` or `ROLLBACK`.
   ///
   /// An already canceled signal fails before anything changes. If the native
   /// end is interrupted, the engine transaction is rolled back without the
   /// signal so it never outlives the emptied stack.
   pub fn end_transaction_with_signal(&self, cancel: Option<&CancellationSignal>) -> Result<()> {
      if let Some(signal) = cancel {
         signal.throw_if_canceled()?;
      }

      self.with_connection(|connection| {
         connection.run_locked(|| {
            let transactions = self.transactions.lock();
            let pending = transactions.borrow().pending_end()?;

            let mut successful = pending.successful;
            let mut listener_error = None;
            if let Some(listener) = pending.listener {
               let outcome = if successful {
                  listener.on_commit()
               } else {
                  listener.on_rollback()
               };
               if let Err(e) = outcome {
                  successful = false;
                  listener_error = Some(e);
               }
            }

            let outermost = transactions.borrow_mut().pop(successful)?;
            let result = if outermost {
               let sql = if successful { "COMMIT;" } else { "ROLLBACK;" };
               debug!(app = %self.app_name, session = %self.session_qualifier, "{sql}");
               match connection.execute(sql, &[], cancel) {
                  Err(e) if e.is_canceled() => {
                     if let Err(rollback) = connection.execute("ROLLBACK;", &[], None) {
                        debug!(app = %self.app_name, session = %self.session_qualifier, error = %rollback, "Rollback after canceled end");
                     }
                     Err(Error::from(e))
                  }
                  other => other.map_err(Error::from),
               }
            } else {
               Ok(())
            };

            match listener_error {
               Some(e) => {
                  if let Err(native) = result {
                     warn!(app = %self.app_name, session = %self.session_qualifier, error = %native, "Ending transaction failed after listener error");
                  }
                  Err(e)
               }
               None => result,
            }
         })
      })
   }

   pub fn in_transaction(&self) -> bool {
      !self.transactions.lock().borrow().is_empty()
   }

   /// Number of open nested transactions.
   pub fn transaction_depth(&self) -> usize {
      self.transactions.lock().borrow().depth()
   }

   /// Routes transaction-control SQL through the structured methods.
   ///
   /// Returns true if `sql` was handled here and must not be executed.
   fn execute_special(&self, sql: &str, cancel: Option<&CancellationSignal>) -> Result<bool> {
      if let Some(signal) = cancel {
         signal.throw_if_canceled()?;
      }

      match special_kind(sql) {
         Some(StatementKind::Begin) => {
            self.begin_transaction_with_signal(TransactionMode::from_begin_sql(sql), None, cancel)?;
            Ok(true)
         }
         Some(StatementKind::Commit) => {
            self.set_transaction_successful()?;
            self.end_transaction_with_signal(cancel)?;
            Ok(true)
         }
         Some(StatementKind::Abort) => {
            self.end_transaction_with_signal(cancel)?;
            Ok(true)
         }
         _ => Ok(false),
      }
   }

   // ---------------------------------------------------------------------
   // Execution
   // ---------------------------------------------------------------------

   pub fn prepare(&self, sql: &str, cancel: Option<&CancellationSignal>) -> Result<StatementInfo> {
      self.with_connection(|connection| Ok(connection.prepare(sql, cancel)?))
   }

   pub fn execute(&self, sql: &str, args: &[Value], cancel: Option<&CancellationSignal>) -> Result<()> {
      self.with_connection(|connection| {
         if self.execute_special(sql, cancel)? {
            return Ok(());
         }
         Ok(connection.execute(sql, args, cancel)?)
      })
   }

   pub fn execute_for_long(
      &self,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
   ) -> Result<Option<i64>> {
      self.with_connection(|connection| {
         if self.execute_special(sql, cancel)? {
            return Ok(None);
         }
         Ok(connection.execute_for_long(sql, args, cancel)?)
      })
   }

   pub fn execute_for_string(
      &self,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
   ) -> Result<Option<String>> {
      self.with_connection(|connection| {
         if self.execute_special(sql, cancel)? {
            return Ok(None);
         }
         Ok(connection.execute_for_string(sql, args, cancel)?)
      })
   }

   pub fn execute_for_changed_row_count(
      &self,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
   ) -> Result<i64> {
      self.with_connection(|connection| {
         if self.execute_special(sql, cancel)? {
            return Ok(0);
         }
         Ok(connection.execute_for_changed_row_count(sql, args, cancel)?)
      })
   }

   pub fn execute_for_last_inserted_row_id(
      &self,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
   ) -> Result<i64> {
      self.with_connection(|connection| {
         if self.execute_special(sql, cancel)? {
            return Ok(-1);
         }
         Ok(connection.execute_for_last_inserted_row_id(sql, args, cancel)?)
      })
   }

   pub fn execute_for_rows(
      &self,
      sql: &str,
      args: &[Value],
      cancel: Option<&CancellationSignal>,
   ) -> Result<Rows> {
      self.with_connection(|connection| {
         if self.execute_special(sql, cancel)? {
            return Ok(Rows::default());
         }
         Ok(connection.execute_for_rows(sql, args, cancel)?)
      })
   }

   /// See [`Connection::execute_for_cursor_window`].
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
      self.with_connection(|connection| {
         if self.execute_special(sql, cancel)? {
            window.clear();
            return Ok(0);
         }
         Ok(connection.execute_for_cursor_window(
            sql,
            args,
            window,
            start_pos,
            required_pos,
            count_all_rows,
            cancel,
         )?)
      })
   }

   // ---------------------------------------------------------------------
   // Cursors and helpers
   // ---------------------------------------------------------------------

   /// Runs `sql` lazily through a [`Cursor`].
   ///
   /// The statement is compiled once up front to validate it and learn its
   /// columns; rows are fetched as the cursor moves.
   pub fn raw_query(
      self: &Arc<Self>,
      sql: &str,
      args: Vec<Value>,
      cancel: Option<CancellationSignal>,
   ) -> Result<Cursor> {
      let info = self.prepare(sql, cancel.as_ref())?;
      let window_bytes = self.shared.lock().config.cursor_window_bytes;
      Cursor::new(Arc::clone(self), sql, args, info.column_names, window_bytes, cancel)
   }

   pub fn query(self: &Arc<Self>, query: &Query, cancel: Option<CancellationSignal>) -> Result<Cursor> {
      let sql = query.build_query_string()?;
      self.raw_query(&sql, query.selection_args().to_vec(), cancel)
   }

   /// Inserts a row, returning its row id.
   pub fn insert(&self, table: &str, null_column_hack: Option<&str>, values: &ContentValues) -> Result<i64> {
      self.insert_with_on_conflict(table, null_column_hack, values, ConflictAlgorithm::None)
   }

   /// Inserts a row, replacing any row it conflicts with.
   pub fn replace(&self, table: &str, null_column_hack: Option<&str>, values: &ContentValues) -> Result<i64> {
      self.insert_with_on_conflict(table, null_column_hack, values, ConflictAlgorithm::Replace)
   }

   pub fn insert_with_on_conflict(
      &self,
      table: &str,
      null_column_hack: Option<&str>,
      values: &ContentValues,
      algorithm: ConflictAlgorithm,
   ) -> Result<i64> {
      let (sql, args) = query::build_insert(table, null_column_hack, values, algorithm)?;
      self.execute_for_last_inserted_row_id(&sql, &args, None)
   }

   /// Updates matching rows, returning how many changed.
   pub fn update(
      &self,
      table: &str,
      values: &ContentValues,
      where_clause: Option<&str>,
      where_args: &[Value],
   ) -> Result<i64> {
      self.update_with_on_conflict(table, values, where_clause, where_args, ConflictAlgorithm::None)
   }

   pub fn update_with_on_conflict(
      &self,
      table: &str,
      values: &ContentValues,
      where_clause: Option<&str>,
      where_args: &[Value],
      algorithm: ConflictAlgorithm,
   ) -> Result<i64> {
      let (sql, args) = query::build_update(table, values, where_clause, where_args, algorithm)?;
      self.execute_for_changed_row_count(&sql, &args, None)
   }

   /// Deletes matching rows, returning how many were removed.
   pub fn delete(&self, table: &str, where_clause: Option<&str>, where_args: &[Value]) -> Result<i64> {
      let sql = query::build_delete(table, where_clause);
      self.execute_for_changed_row_count(&sql, where_args, None)
   }

   // ---------------------------------------------------------------------
   // Settings and diagnostics
   // ---------------------------------------------------------------------

   /// Turns `PRAGMA foreign_keys` on or off.
   ///
   /// Rejected while a transaction is open, where the pragma has no effect.
   pub fn set_foreign_key_constraints_enabled(&self, enable: bool) -> Result<()> {
      if self.shared.lock().config.foreign_key_constraints_enabled == enable {
         return Ok(());
      }
      if self.in_transaction() {
         return Err(Error::TransactionInProgress("Foreign key constraints"));
      }

      self.with_connection(|connection| {
         connection.execute(&format!("PRAGMA foreign_keys = {};", i32::from(enable)), &[], None)?;
         Ok(())
      })?;
      self.shared.lock().config.foreign_key_constraints_enabled = enable;
      Ok(())
   }

   pub fn get_version(&self) -> Result<i64> {
      self.with_connection(|connection| Ok(connection.get_version()?))
   }

   pub fn set_version(&self, version: i64) -> Result<()> {
      self.with_connection(|connection| Ok(connection.set_version(version)?))
   }

   pub fn is_database_integrity_ok(&self) -> Result<bool> {
      self.with_connection(|connection| Ok(connection.is_database_integrity_ok()?))
   }

   /// Appends the session state and its connection dump to `out`.
   pub fn dump(&self, out: &mut String, verbose: bool) {
      let (references, connection) = {
         let shared = self.shared.lock();
         (shared.references, shared.connection.clone())
      };
      let (depth, mode) = match self.transactions.try_lock() {
         Some(transactions) => {
            let stack = transactions.borrow();
            (Some(stack.depth()), stack.top_mode())
         }
         None => (None, None),
      };

      let _ = writeln!(
         out,
         "Session '{}' appName: {} references: {references}",
         self.session_qualifier, self.app_name
      );
      match (depth, mode) {
         (Some(0), _) => {
            let _ = writeln!(out, "  transaction: <none>");
         }
         (Some(depth), Some(mode)) => {
            let _ = writeln!(out, "  transaction: depth {depth}, innermost {mode}");
         }
         _ => {
            let _ = writeln!(out, "  transaction: <busy>");
         }
      }
      match connection {
         Some(connection) => connection.dump(out, verbose),
         None => {
            let _ = writeln!(out, "  <closed>");
         }
      }
   }
}

impl fmt::Debug for Database {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let references = self.shared.lock().references;
      f.debug_struct("Database")
         .field("label", &self.label)
         .field("session_qualifier", &self.session_qualifier)
         .field("references", &references)
         .finish()
   }
}

impl Drop for Database {
   fn drop(&mut self) {
      self.dispose(true);
   }
}

/// Kind of `sql` if it is transaction control handled by the session.
///
/// `ROLLBACK TO <savepoint>` is passed through to the engine.
fn special_kind(sql: &str) -> Option<StatementKind> {
   let kind = StatementKind::classify(sql);
   if !kind.is_transaction_control() {
      return None;
   }
   if kind == StatementKind::Abort
      && sql
         .split(|c: char| c.is_whitespace() || c == ';')
         .any(|w| w.eq_ignore_ascii_case("TO"))
   {
      return None;
   }
   Some(kind)
}
