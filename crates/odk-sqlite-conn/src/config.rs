//! Configuration for SQLite connections

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::value::Value;

/// Largest statement cache a connection may be configured with.
pub const MAX_SQL_CACHE_SIZE: usize = 100;

/// Flags controlling how the database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpenFlags(u32);

impl OpenFlags {
   pub const READ_WRITE: OpenFlags = OpenFlags(0x0000_0000);
   pub const READ_ONLY: OpenFlags = OpenFlags(0x0000_0001);
   /// Accepted for compatibility; collation setup is left to the engine.
   pub const NO_LOCALIZED_COLLATORS: OpenFlags = OpenFlags(0x0000_0010);
   pub const CREATE_IF_NECESSARY: OpenFlags = OpenFlags(0x1000_0000);
   /// Required. No other journaling mode is supported.
   pub const ENABLE_WRITE_AHEAD_LOGGING: OpenFlags = OpenFlags(0x2000_0000);

   pub const fn bits(self) -> u32 {
      self.0
   }

   pub const fn contains(self, other: OpenFlags) -> bool {
      self.0 & other.0 == other.0
   }

   pub fn is_read_only(self) -> bool {
      self.contains(OpenFlags::READ_ONLY)
   }
}

impl Default for OpenFlags {
   fn default() -> Self {
      OpenFlags::READ_WRITE | OpenFlags::CREATE_IF_NECESSARY | OpenFlags::ENABLE_WRITE_AHEAD_LOGGING
   }
}

impl BitOr for OpenFlags {
   type Output = OpenFlags;

   fn bitor(self, rhs: OpenFlags) -> OpenFlags {
      OpenFlags(self.0 | rhs.0)
   }
}

impl BitOrAssign for OpenFlags {
   fn bitor_assign(&mut self, rhs: OpenFlags) {
      self.0 |= rhs.0;
   }
}

/// Pragma values applied, and verified, every time a connection opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PragmaSettings {
   /// Default: 1024
   pub page_size: i64,

   /// Upper bound for the WAL file after a checkpoint, in bytes.
   ///
   /// Default: 3000000
   pub journal_size_limit: i64,

   /// Pages written to the WAL before an automatic checkpoint.
   ///
   /// Default: 1000
   pub wal_autocheckpoint: i64,

   /// Synchronous mode used with WAL (`OFF`, `NORMAL` or `FULL`).
   ///
   /// Default: `FULL`
   pub wal_sync_mode: String,

   /// Native busy timeout in milliseconds. Verified on open but never corrected.
   ///
   /// Default: 5000
   pub busy_timeout_ms: i64,
}

impl Default for PragmaSettings {
   fn default() -> Self {
      Self {
         page_size: 1024,
         journal_size_limit: 3_000_000,
         wal_autocheckpoint: 1000,
         wal_sync_mode: "FULL".to_string(),
         busy_timeout_ms: 5000,
      }
   }
}

/// Callback invoked for a registered SQL function.
///
/// Returning `Err` reports the message to SQLite as the function's error.
pub type FunctionCallback = dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync;

/// A scalar SQL function registered on every connection opened with this configuration.
#[derive(Clone)]
pub struct CustomFunction {
   pub name: String,
   /// Number of arguments, or -1 for any number.
   pub num_args: i32,
   pub callback: Arc<FunctionCallback>,
}

impl CustomFunction {
   pub fn new<F>(name: impl Into<String>, num_args: i32, callback: F) -> Self
   where
      F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
   {
      Self {
         name: name.into(),
         num_args,
         callback: Arc::new(callback),
      }
   }
}

impl fmt::Debug for CustomFunction {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("CustomFunction")
         .field("name", &self.name)
         .field("num_args", &self.num_args)
         .finish_non_exhaustive()
   }
}

/// Configuration record for one database connection.
///
/// # Examples
///
/// ```
/// use odk_sqlite_conn::{DatabaseConfig, OpenFlags};
///
/// let config = DatabaseConfig::new("survey", "/tmp/survey.db");
/// assert!(config.open_flags.contains(OpenFlags::ENABLE_WRITE_AHEAD_LOGGING));
/// assert_eq!(config.max_sql_cache_size, 25);
///
/// let config = DatabaseConfig {
///    max_sql_cache_size: 2,
///    ..DatabaseConfig::new("survey", "/tmp/survey.db")
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
   /// Application the database belongs to. Attached to every log event.
   pub app_name: String,

   /// Database file path.
   pub path: PathBuf,

   /// Label used in logs and dumps. Defaults to the path.
   #[serde(default)]
   pub label: Option<String>,

   #[serde(default)]
   pub open_flags: OpenFlags,

   /// Prepared statements kept per connection, `0..=100`. Zero disables caching.
   ///
   /// Default: 25
   #[serde(default = "default_sql_cache_size")]
   pub max_sql_cache_size: usize,

   /// Default: false
   #[serde(default)]
   pub foreign_key_constraints_enabled: bool,

   /// Byte budget of each cursor window.
   ///
   /// Default: 2 MiB
   #[serde(default = "default_cursor_window_bytes")]
   pub cursor_window_bytes: usize,

   #[serde(default)]
   pub pragmas: PragmaSettings,

   #[serde(skip)]
   pub custom_functions: Vec<CustomFunction>,
}

fn default_sql_cache_size() -> usize {
   25
}

fn default_cursor_window_bytes() -> usize {
   2 * 1024 * 1024
}

impl DatabaseConfig {
   /// Read-write, create-if-necessary, WAL configuration with default pragmas.
   pub fn new(app_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
      Self {
         app_name: app_name.into(),
         path: path.into(),
         label: None,
         open_flags: OpenFlags::default(),
         max_sql_cache_size: default_sql_cache_size(),
         foreign_key_constraints_enabled: false,
         cursor_window_bytes: default_cursor_window_bytes(),
         pragmas: PragmaSettings::default(),
         custom_functions: Vec::new(),
      }
   }

   /// Registers a scalar function on connections opened with this configuration.
   pub fn with_function(mut self, function: CustomFunction) -> Self {
      self.custom_functions.push(function);
      self
   }

   /// Label for logs and dumps with e-mail addresses masked.
   pub fn label(&self) -> String {
      let label = match &self.label {
         Some(label) => label.clone(),
         None => self.path.to_string_lossy().into_owned(),
      };
      strip_emails(&label)
   }

   /// Checks the configuration before a connection is opened.
   pub fn validate(&self) -> Result<()> {
      if self.path.as_os_str().is_empty() {
         return Err(Error::InvalidArgument("path must not be empty".into()));
      }
      if self.max_sql_cache_size > MAX_SQL_CACHE_SIZE {
         return Err(Error::InvalidArgument(format!(
            "max_sql_cache_size must be between 0 and {MAX_SQL_CACHE_SIZE}"
         )));
      }
      if self.cursor_window_bytes == 0 {
         return Err(Error::InvalidArgument("cursor_window_bytes must be positive".into()));
      }
      Ok(())
   }
}

fn email_regex() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r"[\w\.\-]+@[\w\.\-]+").expect("invalid regex"))
}

/// Replaces anything that looks like an e-mail address with `XX@YY`.
pub fn strip_emails(text: &str) -> String {
   email_regex().replace_all(text, "XX@YY").into_owned()
}
