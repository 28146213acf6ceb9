//! Error types for odk-sqlite-conn

use libsqlite3_sys as ffi;
use thiserror::Error;

/// Errors that may occur when working with a [`Connection`](crate::Connection).
#[derive(Error, Debug)]
pub enum Error {
   /// Caller supplied an unusable argument (empty SQL, bad configuration).
   /// Raised before any native call is made.
   #[error("invalid argument: {0}")]
   InvalidArgument(String),

   /// The native handle has been disposed or was never opened.
   #[error("the connection has been closed")]
   ConnectionClosed,

   /// Bound argument count differs from the statement's parameter count.
   #[error("Expected {expected} bind arguments but {actual} were provided.")]
   BindArgumentCount { expected: usize, actual: usize },

   /// Open flags did not request write-ahead logging.
   #[error("only WAL journaling is supported; open flags must include ENABLE_WRITE_AHEAD_LOGGING")]
   WalRequired,

   /// A locking or journal mode pragma silently refused to change.
   #[error("unable to change {pragma} from '{from}' to '{to}'")]
   PragmaNotChanged {
      pragma: &'static str,
      from: String,
      to: String,
   },

   /// Operation canceled, either before it started or while the engine was running it.
   #[error("the operation was canceled")]
   Canceled,

   /// Error reported by the SQLite engine.
   #[error("{message} (code {extended_code})")]
   Sqlite {
      /// Primary result code (`extended_code & 0xff`).
      code: i32,
      extended_code: i32,
      message: String,
   },

   /// IO error when resolving database paths.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Builds an engine error from an extended result code and message.
   ///
   /// `SQLITE_INTERRUPT` is reported as [`Error::Canceled`] so callers can tell
   /// an expected cancellation apart from a fault.
   pub(crate) fn from_native(extended_code: i32, message: impl Into<String>) -> Self {
      let code = extended_code & 0xff;
      if code == ffi::SQLITE_INTERRUPT {
         return Error::Canceled;
      }
      Error::Sqlite {
         code,
         extended_code,
         message: message.into(),
      }
   }

   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::InvalidArgument(_) => "INVALID_ARGUMENT".to_string(),
         Error::ConnectionClosed => "CONNECTION_CLOSED".to_string(),
         Error::BindArgumentCount { .. } => "BIND_ARGUMENT_COUNT".to_string(),
         Error::WalRequired => "WAL_REQUIRED".to_string(),
         Error::PragmaNotChanged { .. } => "PRAGMA_NOT_CHANGED".to_string(),
         Error::Canceled => "OPERATION_CANCELED".to_string(),
         Error::Sqlite { code, .. } => sqlite_code_name(*code).to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }

   /// True when the operation was canceled through a cancellation signal.
   pub fn is_canceled(&self) -> bool {
      matches!(self, Error::Canceled)
   }

   /// True when the engine reports a damaged or foreign database file.
   pub fn is_corruption(&self) -> bool {
      matches!(
         self,
         Error::Sqlite { code, .. } if *code == ffi::SQLITE_CORRUPT || *code == ffi::SQLITE_NOTADB
      )
   }

   /// Primary SQLite result code, if this error came from the engine.
   pub fn sqlite_code(&self) -> Option<i32> {
      match self {
         Error::Sqlite { code, .. } => Some(*code),
         Error::Canceled => Some(ffi::SQLITE_INTERRUPT),
         _ => None,
      }
   }
}

fn sqlite_code_name(code: i32) -> &'static str {
   match code {
      ffi::SQLITE_ERROR => "SQLITE_ERROR",
      ffi::SQLITE_INTERNAL => "SQLITE_INTERNAL",
      ffi::SQLITE_PERM => "SQLITE_PERM",
      ffi::SQLITE_ABORT => "SQLITE_ABORT",
      ffi::SQLITE_BUSY => "SQLITE_BUSY",
      ffi::SQLITE_LOCKED => "SQLITE_LOCKED",
      ffi::SQLITE_NOMEM => "SQLITE_NOMEM",
      ffi::SQLITE_READONLY => "SQLITE_READONLY",
      ffi::SQLITE_IOERR => "SQLITE_IOERR",
      ffi::SQLITE_CORRUPT => "SQLITE_CORRUPT",
      ffi::SQLITE_FULL => "SQLITE_FULL",
      ffi::SQLITE_CANTOPEN => "SQLITE_CANTOPEN",
      ffi::SQLITE_CONSTRAINT => "SQLITE_CONSTRAINT",
      ffi::SQLITE_MISMATCH => "SQLITE_MISMATCH",
      ffi::SQLITE_MISUSE => "SQLITE_MISUSE",
      ffi::SQLITE_RANGE => "SQLITE_RANGE",
      ffi::SQLITE_NOTADB => "SQLITE_NOTADB",
      ffi::SQLITE_DONE => "SQLITE_DONE",
      _ => "SQLITE_UNKNOWN",
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
