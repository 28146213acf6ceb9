//! Statement classification and SQL display helpers.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

/// Coarse classification of a SQL statement by its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementKind {
   Select,
   /// INSERT, UPDATE, REPLACE and DELETE.
   Update,
   Attach,
   Begin,
   /// COMMIT and END.
   Commit,
   /// ROLLBACK.
   Abort,
   Pragma,
   /// CREATE, DROP and ALTER.
   Ddl,
   /// ANALYZE and DETACH.
   Unprepared,
   Other,
}

impl StatementKind {
   /// Classifies `sql` by the first three characters after leading whitespace.
   pub fn classify(sql: &str) -> StatementKind {
      let sql = sql.trim_start();
      let Some(prefix) = sql.get(..3) else {
         return StatementKind::Other;
      };

      match prefix.to_ascii_uppercase().as_str() {
         "SEL" => StatementKind::Select,
         "INS" | "UPD" | "REP" | "DEL" => StatementKind::Update,
         "ATT" => StatementKind::Attach,
         "COM" | "END" => StatementKind::Commit,
         "ROL" => StatementKind::Abort,
         "BEG" => StatementKind::Begin,
         "PRA" => StatementKind::Pragma,
         "CRE" | "DRO" | "ALT" => StatementKind::Ddl,
         "ANA" | "DET" => StatementKind::Unprepared,
         _ => StatementKind::Other,
      }
   }

   /// Only queries and row-changing statements are kept in the statement cache.
   pub fn is_cacheable(self) -> bool {
      matches!(self, StatementKind::Select | StatementKind::Update)
   }

   /// Transaction control that must go through the structured transaction path.
   pub fn is_transaction_control(self) -> bool {
      matches!(
         self,
         StatementKind::Begin | StatementKind::Commit | StatementKind::Abort
      )
   }
}

impl fmt::Display for StatementKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         StatementKind::Select => "SELECT",
         StatementKind::Update => "UPDATE",
         StatementKind::Attach => "ATTACH",
         StatementKind::Begin => "BEGIN",
         StatementKind::Commit => "COMMIT",
         StatementKind::Abort => "ABORT",
         StatementKind::Pragma => "PRAGMA",
         StatementKind::Ddl => "DDL",
         StatementKind::Unprepared => "UNPREPARED",
         StatementKind::Other => "OTHER",
      };
      f.write_str(name)
   }
}

/// Metadata returned by [`Connection::prepare`](crate::Connection::prepare).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementInfo {
   pub num_parameters: usize,
   pub read_only: bool,
   pub column_names: Vec<String>,
}

fn newline_regex() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r"[\s]*\n+[\s]*").expect("invalid regex"))
}

/// Collapses each run of newlines (and surrounding whitespace) into one space.
pub fn trim_sql_for_display(sql: &str) -> String {
   newline_regex().replace_all(sql, " ").into_owned()
}
