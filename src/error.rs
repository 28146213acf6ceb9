/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for session, transaction and cursor operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the underlying connection.
   #[error(transparent)]
   Connection(#[from] odk_sqlite_conn::Error),

   /// `set_transaction_successful` or `end_transaction` without an open transaction.
   #[error("cannot perform this operation because there is no current transaction")]
   NoTransaction,

   /// The innermost transaction was already marked successful.
   #[error(
      "cannot perform this operation because the transaction has already been marked successful; the only thing you can do now is call end_transaction"
   )]
   TransactionMarkedSuccessful,

   /// Operation is not allowed while a transaction is open.
   #[error("{0} may not be changed while in a transaction")]
   TransactionInProgress(&'static str),

   /// The session or cursor has already released its last reference.
   #[error("attempt to re-open an already-closed object: {0}")]
   ObjectClosed(String),

   /// Another thread reported that session initialization failed.
   #[error("initialization of session '{0}' failed")]
   InitializationFailed(String),

   /// A query could not be assembled from its parts.
   #[error("invalid query: {0}")]
   InvalidQuery(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Connection(e) => e.error_code(),
         Error::NoTransaction => "NO_TRANSACTION".to_string(),
         Error::TransactionMarkedSuccessful => "TRANSACTION_MARKED_SUCCESSFUL".to_string(),
         Error::TransactionInProgress(_) => "TRANSACTION_IN_PROGRESS".to_string(),
         Error::ObjectClosed(_) => "OBJECT_CLOSED".to_string(),
         Error::InitializationFailed(_) => "INITIALIZATION_FAILED".to_string(),
         Error::InvalidQuery(_) => "INVALID_QUERY".to_string(),
      }
   }

   /// True when the operation was canceled through a cancellation signal.
   pub fn is_canceled(&self) -> bool {
      matches!(self, Error::Connection(e) if e.is_canceled())
   }

   /// True when the engine reports a damaged database file.
   pub fn is_corruption(&self) -> bool {
      matches!(self, Error::Connection(e) if e.is_corruption())
   }
}
