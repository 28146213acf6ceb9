//! SQLite values used for bind arguments, function arguments and result cells.

use std::fmt;

/// A single SQLite value.
///
/// Mirrors the five storage classes SQLite uses. Booleans bind as `0`/`1`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
   Null,
   Integer(i64),
   Real(f64),
   Text(String),
   Blob(Vec<u8>),
}

impl Value {
   /// Returns true if this value is null.
   pub fn is_null(&self) -> bool {
      matches!(self, Value::Null)
   }

   /// Attempts to get this value as an integer.
   ///
   /// Real values are truncated and numeric text is parsed, matching the
   /// conversions SQLite applies for `sqlite3_column_int64`.
   pub fn as_integer(&self) -> Option<i64> {
      match self {
         Value::Integer(i) => Some(*i),
         Value::Real(r) => Some(*r as i64),
         Value::Text(s) => s.trim().parse().ok(),
         _ => None,
      }
   }

   /// Attempts to get this value as a float.
   pub fn as_real(&self) -> Option<f64> {
      match self {
         Value::Real(r) => Some(*r),
         Value::Integer(i) => Some(*i as f64),
         Value::Text(s) => s.trim().parse().ok(),
         _ => None,
      }
   }

   /// Attempts to get this value as a string reference.
   pub fn as_text(&self) -> Option<&str> {
      match self {
         Value::Text(s) => Some(s),
         _ => None,
      }
   }

   /// Attempts to get this value as a blob reference.
   pub fn as_blob(&self) -> Option<&[u8]> {
      match self {
         Value::Blob(b) => Some(b),
         _ => None,
      }
   }

   /// Renders the value as text the way a string column read would.
   pub fn to_text(&self) -> Option<String> {
      match self {
         Value::Null => None,
         Value::Integer(i) => Some(i.to_string()),
         Value::Real(r) => Some(r.to_string()),
         Value::Text(s) => Some(s.clone()),
         Value::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
      }
   }

   /// Approximate storage footprint, used for window capacity accounting.
   pub(crate) fn footprint(&self) -> usize {
      match self {
         Value::Null | Value::Integer(_) | Value::Real(_) => 8,
         Value::Text(s) => s.len() + 1,
         Value::Blob(b) => b.len(),
      }
   }

   /// Form used by the operation log. Blob contents are never logged.
   pub(crate) fn describe(&self) -> String {
      match self {
         Value::Null => "null".to_string(),
         Value::Blob(_) => "<byte[]>".to_string(),
         Value::Text(s) => format!("\"{s}\""),
         other => other.to_string(),
      }
   }

   /// Copy kept by the operation log: blob payloads are dropped.
   pub(crate) fn redacted(&self) -> Value {
      match self {
         Value::Blob(_) => Value::Blob(Vec::new()),
         other => other.clone(),
      }
   }
}

impl fmt::Display for Value {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Value::Null => f.write_str("NULL"),
         Value::Integer(i) => write!(f, "{i}"),
         Value::Real(r) => write!(f, "{r}"),
         Value::Text(s) => f.write_str(s),
         Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
      }
   }
}

impl From<i64> for Value {
   fn from(v: i64) -> Self {
      Value::Integer(v)
   }
}

impl From<i32> for Value {
   fn from(v: i32) -> Self {
      Value::Integer(i64::from(v))
   }
}

impl From<u32> for Value {
   fn from(v: u32) -> Self {
      Value::Integer(i64::from(v))
   }
}

impl From<bool> for Value {
   fn from(v: bool) -> Self {
      Value::Integer(i64::from(v))
   }
}

impl From<f64> for Value {
   fn from(v: f64) -> Self {
      Value::Real(v)
   }
}

impl From<&str> for Value {
   fn from(v: &str) -> Self {
      Value::Text(v.to_string())
   }
}

impl From<String> for Value {
   fn from(v: String) -> Self {
      Value::Text(v)
   }
}

impl From<Vec<u8>> for Value {
   fn from(v: Vec<u8>) -> Self {
      Value::Blob(v)
   }
}

impl From<&[u8]> for Value {
   fn from(v: &[u8]) -> Self {
      Value::Blob(v.to_vec())
   }
}

impl<T: Into<Value>> From<Option<T>> for Value {
   fn from(v: Option<T>) -> Self {
      v.map_or(Value::Null, Into::into)
   }
}
