//! SQL assembly for SELECT, INSERT, UPDATE and DELETE helpers

use std::sync::OnceLock;

use indexmap::IndexMap;
use odk_sqlite_conn::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Column name to value map. Insertion order is the column order in the SQL.
pub type ContentValues = IndexMap<String, Value>;

/// What the engine does when an insert or update violates a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAlgorithm {
   /// Use the table's declared conflict resolution (ABORT unless specified).
   #[default]
   None,
   Rollback,
   Abort,
   Fail,
   Ignore,
   Replace,
}

impl ConflictAlgorithm {
   fn clause(self) -> &'static str {
      match self {
         ConflictAlgorithm::None => "",
         ConflictAlgorithm::Rollback => " OR ROLLBACK",
         ConflictAlgorithm::Abort => " OR ABORT",
         ConflictAlgorithm::Fail => " OR FAIL",
         ConflictAlgorithm::Ignore => " OR IGNORE",
         ConflictAlgorithm::Replace => " OR REPLACE",
      }
   }
}

fn limit_regex() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r"^\s*\d+\s*(,\s*\d+\s*)?$").expect("invalid regex"))
}

/// Builder for a SELECT statement run through [`Database::query`](crate::Database::query).
///
/// # Example
///
/// ```
/// use odk_sqlite::Query;
///
/// let query = Query::table("instances")
///    .columns(["id", "state"])
///    .selection("state = ?", vec!["COMPLETE".into()])
///    .order_by("id DESC")
///    .limit("10");
/// assert_eq!(
///    query.build_query_string().unwrap(),
///    "SELECT id, state FROM instances WHERE state = ? ORDER BY id DESC LIMIT 10"
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct Query {
   distinct: bool,
   table: String,
   columns: Vec<String>,
   selection: Option<String>,
   selection_args: Vec<Value>,
   group_by: Option<String>,
   having: Option<String>,
   order_by: Option<String>,
   limit: Option<String>,
}

impl Query {
   /// Query over `table`, which may be any FROM expression including joins.
   pub fn table(table: impl Into<String>) -> Self {
      Self {
         table: table.into(),
         ..Self::default()
      }
   }

   pub fn distinct(mut self) -> Self {
      self.distinct = true;
      self
   }

   /// Result columns. No columns selects `*`.
   pub fn columns<I, S>(mut self, columns: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self.columns = columns.into_iter().map(Into::into).collect();
      self
   }

   /// WHERE clause without the keyword, with its bind arguments.
   pub fn selection(mut self, selection: impl Into<String>, args: Vec<Value>) -> Self {
      self.selection = Some(selection.into());
      self.selection_args = args;
      self
   }

   pub fn group_by(mut self, group_by: impl Into<String>) -> Self {
      self.group_by = Some(group_by.into());
      self
   }

   /// Only permitted together with [`group_by`](Self::group_by).
   pub fn having(mut self, having: impl Into<String>) -> Self {
      self.having = Some(having.into());
      self
   }

   pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
      self.order_by = Some(order_by.into());
      self
   }

   /// `"N"` or `"offset, N"`.
   pub fn limit(mut self, limit: impl Into<String>) -> Self {
      self.limit = Some(limit.into());
      self
   }

   pub fn selection_args(&self) -> &[Value] {
      &self.selection_args
   }

   /// Assembles the SELECT text.
   ///
   /// Fails if HAVING is given without GROUP BY or LIMIT is not one or two
   /// integers.
   pub fn build_query_string(&self) -> Result<String> {
      let group_by = non_empty(&self.group_by);
      let having = non_empty(&self.having);
      let limit = non_empty(&self.limit);

      if group_by.is_none() && having.is_some() {
         return Err(Error::InvalidQuery(
            "HAVING clauses are only permitted when using a GROUP BY clause".into(),
         ));
      }
      if let Some(limit) = limit
         && !limit_regex().is_match(limit)
      {
         return Err(Error::InvalidQuery(format!("invalid LIMIT clause: {limit}")));
      }
      if self.table.trim().is_empty() {
         return Err(Error::InvalidQuery("a table is required".into()));
      }

      let mut sql = String::with_capacity(120);
      sql.push_str("SELECT ");
      if self.distinct {
         sql.push_str("DISTINCT ");
      }
      if self.columns.is_empty() {
         sql.push_str("* ");
      } else {
         sql.push_str(&self.columns.join(", "));
         sql.push(' ');
      }
      sql.push_str("FROM ");
      sql.push_str(&self.table);
      append_clause(&mut sql, " WHERE ", non_empty(&self.selection));
      append_clause(&mut sql, " GROUP BY ", group_by);
      append_clause(&mut sql, " HAVING ", having);
      append_clause(&mut sql, " ORDER BY ", non_empty(&self.order_by));
      append_clause(&mut sql, " LIMIT ", limit);
      Ok(sql)
   }
}

fn non_empty(clause: &Option<String>) -> Option<&str> {
   clause.as_deref().filter(|c| !c.is_empty())
}

fn append_clause(sql: &mut String, keyword: &str, clause: Option<&str>) {
   if let Some(clause) = clause {
      sql.push_str(keyword);
      sql.push_str(clause);
   }
}

/// INSERT text and bind arguments for `values`.
///
/// With no values, `null_column_hack` names a column that receives NULL so
/// that an otherwise empty row can be inserted.
pub fn build_insert(
   table: &str,
   null_column_hack: Option<&str>,
   values: &ContentValues,
   algorithm: ConflictAlgorithm,
) -> Result<(String, Vec<Value>)> {
   let mut sql = format!("INSERT{} INTO {table}(", algorithm.clause());
   if values.is_empty() {
      let Some(column) = null_column_hack else {
         return Err(Error::InvalidQuery(
            "cannot insert an empty row without a null column hack".into(),
         ));
      };
      sql.push_str(column);
      sql.push_str(") VALUES (NULL)");
      return Ok((sql, Vec::new()));
   }

   let columns: Vec<&str> = values.keys().map(String::as_str).collect();
   sql.push_str(&columns.join(","));
   sql.push_str(") VALUES (");
   sql.push_str(&vec!["?"; values.len()].join(","));
   sql.push(')');
   Ok((sql, values.values().cloned().collect()))
}

/// UPDATE text and bind arguments: the new values followed by `where_args`.
pub fn build_update(
   table: &str,
   values: &ContentValues,
   where_clause: Option<&str>,
   where_args: &[Value],
   algorithm: ConflictAlgorithm,
) -> Result<(String, Vec<Value>)> {
   if values.is_empty() {
      return Err(Error::InvalidQuery("empty values".into()));
   }

   let assignments: Vec<String> = values.keys().map(|column| format!("{column}=?")).collect();
   let mut sql = format!("UPDATE{} {table} SET {}", algorithm.clause(), assignments.join(","));
   append_clause(&mut sql, " WHERE ", where_clause.filter(|w| !w.is_empty()));

   let mut args: Vec<Value> = values.values().cloned().collect();
   args.extend_from_slice(where_args);
   Ok((sql, args))
}

/// DELETE text. No where clause deletes every row.
pub fn build_delete(table: &str, where_clause: Option<&str>) -> String {
   let mut sql = format!("DELETE FROM {table}");
   append_clause(&mut sql, " WHERE ", where_clause.filter(|w| !w.is_empty()));
   sql
}
