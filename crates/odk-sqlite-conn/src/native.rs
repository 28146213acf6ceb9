//! Owned SQLite handles.
//!
//! Every `unsafe` call into the engine lives in this module. The rest of the
//! crate only sees [`NativeConnection`] and [`NativeStatement`], each of which
//! owns exactly one engine resource, is not `Clone`, and releases it through a
//! single consuming method (`close` / `finalize`). Their `Drop` impls exist to
//! report leaks and are not the primary cleanup path.

use libsqlite3_sys as ffi;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::cancellation::InterruptFlag;
use crate::config::{CustomFunction, FunctionCallback, OpenFlags};
use crate::error::{Error, Result};
use crate::value::Value;

// The generated bindings leave out sqlite3_close_v2, but the linked library
// exports it. Closing must defer to the last finalize because statements
// checked out of the cache are finalized only when they are released.
unsafe extern "C" {
   fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> c_int;
}

/// VM instructions between progress handler polls while cancellation is armed.
const PROGRESS_HANDLER_PERIOD: c_int = 4;

/// Result of stepping a statement once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
   Row,
   Done,
}

/// Sole owner of a `sqlite3` database handle.
pub(crate) struct NativeConnection {
   db: Option<NonNull<ffi::sqlite3>>,
   label: String,
   interrupt: Arc<InterruptFlag>,
}

// SAFETY: the handle is only used by the owning Connection, which serializes
// every call behind its own mutex. The engine is compiled threadsafe, so moving
// the handle between threads is permitted.
unsafe impl Send for NativeConnection {}

impl NativeConnection {
   /// Opens the database file and installs the native busy timeout.
   ///
   /// `interrupt` is the flag read by the progress handler once cancellation
   /// is armed; it is kept alive for as long as the handle.
   pub(crate) fn open(
      path: &Path,
      flags: OpenFlags,
      label: &str,
      busy_timeout_ms: i64,
      interrupt: Arc<InterruptFlag>,
   ) -> Result<Self> {
      let c_path = CString::new(path.as_os_str().as_encoded_bytes())
         .map_err(|_| Error::InvalidArgument("path contains an interior NUL byte".into()))?;

      let mut native_flags = if flags.is_read_only() {
         ffi::SQLITE_OPEN_READONLY
      } else {
         ffi::SQLITE_OPEN_READWRITE
      };
      if flags.contains(OpenFlags::CREATE_IF_NECESSARY) {
         native_flags |= ffi::SQLITE_OPEN_CREATE;
      }

      let mut db: *mut ffi::sqlite3 = ptr::null_mut();
      // SAFETY: c_path is NUL terminated and outlives the call; db is a valid out pointer.
      let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, native_flags, ptr::null()) };

      if rc != ffi::SQLITE_OK {
         let error = match NonNull::new(db) {
            Some(handle) => {
               // SAFETY: open_v2 hands back a handle even on failure; it must be closed.
               let error = unsafe { error_from_handle(handle.as_ptr(), rc) };
               unsafe { sqlite3_close_v2(handle.as_ptr()) };
               error
            }
            None => Error::from_native(rc, "out of memory"),
         };
         return Err(error);
      }

      let Some(handle) = NonNull::new(db) else {
         return Err(Error::Other("sqlite3_open_v2 returned a null handle".into()));
      };

      let timeout = c_int::try_from(busy_timeout_ms).unwrap_or(c_int::MAX);
      // SAFETY: handle was just opened successfully.
      unsafe {
         ffi::sqlite3_extended_result_codes(handle.as_ptr(), 1);
         ffi::sqlite3_busy_timeout(handle.as_ptr(), timeout);
      }

      trace!(label = %label, "Opened native connection");

      Ok(Self {
         db: Some(handle),
         label: label.to_string(),
         interrupt,
      })
   }

   fn raw(&self) -> Result<*mut ffi::sqlite3> {
      self.db.map(NonNull::as_ptr).ok_or(Error::ConnectionClosed)
   }

   /// Address of the handle, for diagnostic dumps only.
   pub(crate) fn address(&self) -> usize {
      self.db.map_or(0, |db| db.as_ptr() as usize)
   }

   /// Registers a scalar function implemented by a Rust closure.
   pub(crate) fn register_function(&self, function: &CustomFunction) -> Result<()> {
      let db = self.raw()?;
      let name = CString::new(function.name.as_str())
         .map_err(|_| Error::InvalidArgument(format!("invalid function name '{}'", function.name)))?;
      let user_data = Box::into_raw(Box::new(Arc::clone(&function.callback)));

      // SAFETY: user_data is released by destroy_function, which SQLite also
      // calls when registration fails.
      let rc = unsafe {
         ffi::sqlite3_create_function_v2(
            db,
            name.as_ptr(),
            function.num_args,
            ffi::SQLITE_UTF8,
            user_data.cast::<c_void>(),
            Some(call_function),
            None,
            None,
            Some(destroy_function),
         )
      };
      if rc != ffi::SQLITE_OK {
         return Err(unsafe { error_from_handle(db, rc) });
      }
      Ok(())
   }

   /// Compiles the first statement in `sql`.
   pub(crate) fn prepare(&self, sql: &str) -> Result<NativeStatement> {
      let db = self.raw()?;
      let len = c_int::try_from(sql.len())
         .map_err(|_| Error::InvalidArgument("SQL text is too long".into()))?;
      let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();

      // SAFETY: sql is valid for len bytes; an explicit length means no NUL terminator is needed.
      let rc = unsafe {
         ffi::sqlite3_prepare_v2(db, sql.as_ptr().cast::<c_char>(), len, &mut stmt, ptr::null_mut())
      };
      if rc != ffi::SQLITE_OK {
         return Err(unsafe { error_from_handle(db, rc) });
      }

      match NonNull::new(stmt) {
         Some(stmt) => {
            trace!(label = %self.label, "Compiled statement");
            Ok(NativeStatement { stmt: Some(stmt) })
         }
         None => Err(Error::InvalidArgument("SQL text contains no statement".into())),
      }
   }

   /// Rows modified by the most recent INSERT, UPDATE or DELETE.
   pub(crate) fn changes(&self) -> Result<i64> {
      let db = self.raw()?;
      Ok(i64::from(unsafe { ffi::sqlite3_changes(db) }))
   }

   pub(crate) fn last_insert_rowid(&self) -> Result<i64> {
      let db = self.raw()?;
      Ok(unsafe { ffi::sqlite3_last_insert_rowid(db) })
   }

   /// Lookaside memory slots currently checked out.
   pub(crate) fn lookaside_used(&self) -> i32 {
      let Ok(db) = self.raw() else {
         return 0;
      };
      let mut current: c_int = 0;
      let mut highwater: c_int = 0;
      // SAFETY: out pointers are valid locals.
      unsafe {
         ffi::sqlite3_db_status(
            db,
            ffi::SQLITE_DBSTATUS_LOOKASIDE_USED,
            &mut current,
            &mut highwater,
            0,
         );
      }
      current
   }

   /// Arms or disarms cancellation. Either way the interrupt flag is cleared.
   pub(crate) fn reset_cancel(&self, armed: bool) {
      self.interrupt.reset();
      let Ok(db) = self.raw() else {
         return;
      };
      // SAFETY: the flag is owned through an Arc held by self, so the pointer
      // stays valid until the handler is removed or the handle is closed.
      unsafe {
         if armed {
            let data = Arc::as_ptr(&self.interrupt).cast_mut().cast::<c_void>();
            ffi::sqlite3_progress_handler(db, PROGRESS_HANDLER_PERIOD, Some(progress_callback), data);
         } else {
            ffi::sqlite3_progress_handler(db, 0, None, ptr::null_mut());
         }
      }
   }

   /// Closes the handle. Statements not yet finalized keep the engine alive
   /// until they are (`sqlite3_close_v2` semantics).
   pub(crate) fn close(mut self) -> Result<()> {
      match self.db.take() {
         Some(db) => close_handle(db, &self.label),
         None => Ok(()),
      }
   }
}

impl Drop for NativeConnection {
   fn drop(&mut self) {
      if let Some(db) = self.db.take() {
         warn!(label = %self.label, "Native connection dropped without close(); closing it now");
         let _ = close_handle(db, &self.label);
      }
   }
}

fn close_handle(db: NonNull<ffi::sqlite3>, label: &str) -> Result<()> {
   // SAFETY: db is owned and is never used again after this call.
   let rc = unsafe { sqlite3_close_v2(db.as_ptr()) };
   if rc != ffi::SQLITE_OK {
      warn!(label = %label, code = rc, "sqlite3_close_v2 failed");
      return Err(Error::from_native(rc, "failed to close the database"));
   }
   trace!(label = %label, "Closed native connection");
   Ok(())
}

/// Sole owner of a compiled `sqlite3_stmt`.
pub(crate) struct NativeStatement {
   stmt: Option<NonNull<ffi::sqlite3_stmt>>,
}

// SAFETY: statements are only touched under the owning connection's mutex or
// the cache lock, never concurrently.
unsafe impl Send for NativeStatement {}

impl NativeStatement {
   fn raw(&self) -> Result<*mut ffi::sqlite3_stmt> {
      self.stmt.map(NonNull::as_ptr).ok_or(Error::Other("statement already finalized".into()))
   }

   fn error(&self, rc: c_int) -> Error {
      match self.raw() {
         // SAFETY: a live statement always belongs to an open handle.
         Ok(stmt) => unsafe { error_from_handle(ffi::sqlite3_db_handle(stmt), rc) },
         Err(e) => e,
      }
   }

   pub(crate) fn address(&self) -> usize {
      self.stmt.map_or(0, |stmt| stmt.as_ptr() as usize)
   }

   pub(crate) fn parameter_count(&self) -> usize {
      match self.raw() {
         Ok(stmt) => unsafe { ffi::sqlite3_bind_parameter_count(stmt) }.max(0) as usize,
         Err(_) => 0,
      }
   }

   pub(crate) fn is_read_only(&self) -> bool {
      match self.raw() {
         Ok(stmt) => unsafe { ffi::sqlite3_stmt_readonly(stmt) != 0 },
         Err(_) => false,
      }
   }

   pub(crate) fn column_count(&self) -> usize {
      match self.raw() {
         Ok(stmt) => unsafe { ffi::sqlite3_column_count(stmt) }.max(0) as usize,
         Err(_) => 0,
      }
   }

   pub(crate) fn column_names(&self) -> Vec<String> {
      let Ok(stmt) = self.raw() else {
         return Vec::new();
      };
      (0..self.column_count())
         .map(|i| {
            // SAFETY: i < column_count; the returned string is copied before the next call.
            let name = unsafe { ffi::sqlite3_column_name(stmt, i as c_int) };
            if name.is_null() {
               String::new()
            } else {
               unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
            }
         })
         .collect()
   }

   /// Binds `args` to parameters `1..=args.len()`.
   pub(crate) fn bind_all(&self, args: &[Value]) -> Result<()> {
      let stmt = self.raw()?;
      for (i, arg) in args.iter().enumerate() {
         let index = (i + 1) as c_int;
         // SAFETY: TRANSIENT makes SQLite copy text and blob data before returning.
         let rc = unsafe {
            match arg {
               Value::Null => ffi::sqlite3_bind_null(stmt, index),
               Value::Integer(v) => ffi::sqlite3_bind_int64(stmt, index, *v),
               Value::Real(v) => ffi::sqlite3_bind_double(stmt, index, *v),
               Value::Text(s) => {
                  let len = c_int::try_from(s.len()).map_err(|_| too_big(i))?;
                  ffi::sqlite3_bind_text(
                     stmt,
                     index,
                     s.as_ptr().cast::<c_char>(),
                     len,
                     ffi::SQLITE_TRANSIENT(),
                  )
               }
               Value::Blob(b) if b.is_empty() => ffi::sqlite3_bind_zeroblob(stmt, index, 0),
               Value::Blob(b) => {
                  let len = c_int::try_from(b.len()).map_err(|_| too_big(i))?;
                  ffi::sqlite3_bind_blob(
                     stmt,
                     index,
                     b.as_ptr().cast::<c_void>(),
                     len,
                     ffi::SQLITE_TRANSIENT(),
                  )
               }
            }
         };
         if rc != ffi::SQLITE_OK {
            return Err(self.error(rc));
         }
      }
      Ok(())
   }

   /// Steps once. On failure the statement is reset so it can be reused.
   pub(crate) fn step(&self) -> Result<Step> {
      let stmt = self.raw()?;
      match unsafe { ffi::sqlite3_step(stmt) } {
         ffi::SQLITE_ROW => Ok(Step::Row),
         ffi::SQLITE_DONE => Ok(Step::Done),
         rc => {
            let error = self.error(rc);
            unsafe { ffi::sqlite3_reset(stmt) };
            Err(error)
         }
      }
   }

   /// Value of column `index` in the current row.
   pub(crate) fn column_value(&self, index: usize) -> Value {
      let Ok(stmt) = self.raw() else {
         return Value::Null;
      };
      let i = index as c_int;
      // SAFETY: only called after step() returned Row; pointers are copied immediately.
      unsafe {
         match ffi::sqlite3_column_type(stmt, i) {
            ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_column_int64(stmt, i)),
            ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_column_double(stmt, i)),
            ffi::SQLITE_TEXT => {
               let text = ffi::sqlite3_column_text(stmt, i);
               let len = ffi::sqlite3_column_bytes(stmt, i).max(0) as usize;
               Value::Text(text_from_raw(text, len))
            }
            ffi::SQLITE_BLOB => {
               let blob = ffi::sqlite3_column_blob(stmt, i);
               let len = ffi::sqlite3_column_bytes(stmt, i).max(0) as usize;
               Value::Blob(bytes_from_raw(blob.cast::<u8>(), len))
            }
            _ => Value::Null,
         }
      }
   }

   pub(crate) fn read_row(&self) -> Vec<Value> {
      (0..self.column_count()).map(|i| self.column_value(i)).collect()
   }

   /// Resets the statement and clears its bindings for reuse.
   pub(crate) fn reset_and_clear(&self) -> Result<()> {
      let stmt = self.raw()?;
      let mut rc = unsafe { ffi::sqlite3_reset(stmt) };
      if rc == ffi::SQLITE_OK {
         rc = unsafe { ffi::sqlite3_clear_bindings(stmt) };
      }
      if rc != ffi::SQLITE_OK {
         return Err(self.error(rc));
      }
      Ok(())
   }

   /// Releases the compiled statement.
   pub(crate) fn finalize(mut self) -> Result<()> {
      match self.stmt.take() {
         Some(stmt) => finalize_statement(stmt),
         None => Ok(()),
      }
   }
}

impl Drop for NativeStatement {
   fn drop(&mut self) {
      if let Some(stmt) = self.stmt.take() {
         warn!("Native statement dropped without finalize(); finalizing it now");
         let _ = finalize_statement(stmt);
      }
   }
}

fn finalize_statement(stmt: NonNull<ffi::sqlite3_stmt>) -> Result<()> {
   // SAFETY: stmt is owned and never used after this call.
   let rc = unsafe { ffi::sqlite3_finalize(stmt.as_ptr()) };
   trace!(address = stmt.as_ptr() as usize, "Finalized statement");
   // finalize reports the last step error; the resource is released either way.
   if rc != ffi::SQLITE_OK {
      return Err(Error::from_native(rc, "statement finalized after a failed step"));
   }
   Ok(())
}

fn too_big(index: usize) -> Error {
   Error::InvalidArgument(format!("bind argument {} is too large", index + 1))
}

/// Builds an error from the handle's current message.
///
/// # Safety
///
/// `db` must be null or a live handle.
unsafe fn error_from_handle(db: *mut ffi::sqlite3, rc: c_int) -> Error {
   if db.is_null() {
      return Error::from_native(rc, "unknown error");
   }
   let extended = unsafe { ffi::sqlite3_extended_errcode(db) };
   let code = if extended & 0xff == rc & 0xff { extended } else { rc };
   let message = unsafe { ffi::sqlite3_errmsg(db) };
   let message = if message.is_null() {
      "unknown error".to_string()
   } else {
      unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
   };
   Error::from_native(code, message)
}

/// # Safety
///
/// `ptr` must be null or valid for `len` bytes.
unsafe fn bytes_from_raw(ptr: *const u8, len: usize) -> Vec<u8> {
   if ptr.is_null() || len == 0 {
      return Vec::new();
   }
   unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
}

/// # Safety
///
/// `ptr` must be null or valid for `len` bytes.
unsafe fn text_from_raw(ptr: *const u8, len: usize) -> String {
   let bytes = unsafe { bytes_from_raw(ptr, len) };
   String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

unsafe extern "C" fn progress_callback(data: *mut c_void) -> c_int {
   // SAFETY: data is the InterruptFlag registered by reset_cancel.
   let flag = unsafe { &*data.cast::<InterruptFlag>() };
   c_int::from(flag.is_set())
}

unsafe extern "C" fn call_function(
   ctx: *mut ffi::sqlite3_context,
   argc: c_int,
   argv: *mut *mut ffi::sqlite3_value,
) {
   // SAFETY: user data is the boxed callback installed by register_function.
   let callback = unsafe { &*ffi::sqlite3_user_data(ctx).cast::<Arc<FunctionCallback>>() };
   let args: Vec<Value> = (0..argc.max(0) as usize)
      .map(|i| unsafe { value_from_native(*argv.add(i)) })
      .collect();

   match panic::catch_unwind(AssertUnwindSafe(|| (**callback)(&args))) {
      Ok(Ok(value)) => unsafe { set_result(ctx, &value) },
      Ok(Err(message)) => unsafe { set_error(ctx, &message) },
      Err(_) => unsafe { set_error(ctx, "custom function panicked") },
   }
}

unsafe extern "C" fn destroy_function(data: *mut c_void) {
   // SAFETY: data came from Box::into_raw in register_function.
   drop(unsafe { Box::from_raw(data.cast::<Arc<FunctionCallback>>()) });
}

unsafe fn value_from_native(value: *mut ffi::sqlite3_value) -> Value {
   unsafe {
      match ffi::sqlite3_value_type(value) {
         ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_value_int64(value)),
         ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_value_double(value)),
         ffi::SQLITE_TEXT => {
            let text = ffi::sqlite3_value_text(value);
            let len = ffi::sqlite3_value_bytes(value).max(0) as usize;
            Value::Text(text_from_raw(text, len))
         }
         ffi::SQLITE_BLOB => {
            let blob = ffi::sqlite3_value_blob(value);
            let len = ffi::sqlite3_value_bytes(value).max(0) as usize;
            Value::Blob(bytes_from_raw(blob.cast::<u8>(), len))
         }
         _ => Value::Null,
      }
   }
}

unsafe fn set_result(ctx: *mut ffi::sqlite3_context, value: &Value) {
   unsafe {
      match value {
         Value::Null => ffi::sqlite3_result_null(ctx),
         Value::Integer(v) => ffi::sqlite3_result_int64(ctx, *v),
         Value::Real(v) => ffi::sqlite3_result_double(ctx, *v),
         Value::Text(s) => match c_int::try_from(s.len()) {
            Ok(len) => ffi::sqlite3_result_text(
               ctx,
               s.as_ptr().cast::<c_char>(),
               len,
               ffi::SQLITE_TRANSIENT(),
            ),
            Err(_) => ffi::sqlite3_result_error_toobig(ctx),
         },
         Value::Blob(b) => match c_int::try_from(b.len()) {
            Ok(len) => ffi::sqlite3_result_blob(
               ctx,
               b.as_ptr().cast::<c_void>(),
               len,
               ffi::SQLITE_TRANSIENT(),
            ),
            Err(_) => ffi::sqlite3_result_error_toobig(ctx),
         },
      }
   }
}

unsafe fn set_error(ctx: *mut ffi::sqlite3_context, message: &str) {
   let len = c_int::try_from(message.len()).unwrap_or(c_int::MAX);
   unsafe { ffi::sqlite3_result_error(ctx, message.as_ptr().cast::<c_char>(), len) };
}
