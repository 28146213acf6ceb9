//! Forward and random access over a query result through a cursor window.
//!
//! Only one window of rows is held at a time. The first fill also counts
//! every row of the result; later fills reuse that count and stop stepping as
//! soon as the window is full.

use std::sync::Arc;

use odk_sqlite_conn::{CancellationSignal, CursorWindow, Value, trim_sql_for_display};
use tracing::error;

use crate::database::Database;
use crate::{Error, Result};

/// Cursor over the rows of one query.
///
/// Holds a reference on its [`Database`] until [`close`](Self::close) or drop.
/// Positions are `-1` before the first row and `count` after the last.
pub struct Cursor {
   database: Arc<Database>,
   sql: String,
   args: Vec<Value>,
   cancel: Option<CancellationSignal>,
   columns: Vec<String>,
   window_bytes: usize,
   window: Option<CursorWindow>,
   count: Option<usize>,
   window_capacity: usize,
   position: isize,
   closed: bool,
}

impl Cursor {
   pub(crate) fn new(
      database: Arc<Database>,
      sql: &str,
      args: Vec<Value>,
      columns: Vec<String>,
      window_bytes: usize,
      cancel: Option<CancellationSignal>,
   ) -> Result<Self> {
      database.acquire_reference()?;
      Ok(Self {
         database,
         sql: sql.to_string(),
         args,
         cancel,
         columns,
         window_bytes,
         window: None,
         count: None,
         window_capacity: 0,
         position: -1,
         closed: false,
      })
   }

   pub fn sql(&self) -> &str {
      &self.sql
   }

   pub fn column_names(&self) -> &[String] {
      &self.columns
   }

   pub fn column_count(&self) -> usize {
      self.columns.len()
   }

   /// Index of `name`, ignoring case.
   ///
   /// A `table.` qualifier is stripped; result columns are never qualified.
   pub fn column_index(&self, name: &str) -> Option<usize> {
      let name = match name.rfind('.') {
         Some(dot) => {
            error!(sql = %trim_sql_for_display(&self.sql), column = name, "Requesting column name with table name");
            &name[dot + 1..]
         }
         None => name,
      };
      self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
   }

   /// Like [`column_index`](Self::column_index) but fails for unknown columns.
   pub fn column_index_or_err(&self, name: &str) -> Result<usize> {
      self
         .column_index(name)
         .ok_or_else(|| Error::InvalidQuery(format!("column '{name}' does not exist")))
   }

   pub fn is_closed(&self) -> bool {
      self.closed
   }

   /// Current position, `-1` before the first row.
   pub fn position(&self) -> isize {
      self.position
   }

   /// Number of rows in the result.
   ///
   /// The first call fills a window at position 0 and counts every row; the
   /// count is cached until [`requery`](Self::requery).
   pub fn get_count(&mut self) -> Result<usize> {
      self.throw_if_closed()?;
      if let Some(count) = self.count {
         return Ok(count);
      }
      self.fill_window(0)?;
      Ok(self.count.unwrap_or(0))
   }

   /// Moves to `position`, returning false if it is outside the result.
   ///
   /// Out of range positions park the cursor before the first row or after
   /// the last.
   pub fn move_to_position(&mut self, position: isize) -> Result<bool> {
      self.throw_if_closed()?;
      let count = self.get_count()?;
      let end = isize::try_from(count).unwrap_or(isize::MAX);
      if position >= end {
         self.position = end;
         return Ok(false);
      }
      if position < 0 {
         self.position = -1;
         return Ok(false);
      }
      if position == self.position {
         return Ok(true);
      }

      let target = position as usize;
      if !self.window.as_ref().is_some_and(|w| w.contains_position(target)) {
         self.fill_window(target)?;
      }
      self.position = position;
      Ok(true)
   }

   pub fn move_by(&mut self, offset: isize) -> Result<bool> {
      self.move_to_position(self.position.saturating_add(offset))
   }

   pub fn move_to_first(&mut self) -> Result<bool> {
      self.move_to_position(0)
   }

   pub fn move_to_last(&mut self) -> Result<bool> {
      let count = self.get_count()?;
      self.move_to_position(count as isize - 1)
   }

   pub fn move_to_next(&mut self) -> Result<bool> {
      self.move_by(1)
   }

   pub fn move_to_previous(&mut self) -> Result<bool> {
      self.move_by(-1)
   }

   pub fn is_before_first(&mut self) -> Result<bool> {
      Ok(self.get_count()? == 0 || self.position == -1)
   }

   pub fn is_after_last(&mut self) -> Result<bool> {
      let count = self.get_count()?;
      Ok(count == 0 || self.position == count as isize)
   }

   /// Value at `column` of the current row.
   pub fn get_value(&self, column: usize) -> Result<&Value> {
      self.throw_if_closed()?;
      let position = usize::try_from(self.position)
         .map_err(|_| Error::InvalidQuery("cursor is before the first row".into()))?;
      let window = self
         .window
         .as_ref()
         .ok_or_else(|| Error::InvalidQuery("cursor has no current row".into()))?;
      if column >= self.columns.len() {
         return Err(Error::InvalidQuery(format!(
            "column {column} out of range, the cursor has {} columns",
            self.columns.len()
         )));
      }
      window.value(position, column).ok_or_else(|| {
         Error::InvalidQuery(format!("row {position} is outside the cursor window"))
      })
   }

   pub fn is_null(&self, column: usize) -> Result<bool> {
      Ok(self.get_value(column)?.is_null())
   }

   /// Integer value; text is parsed and reals truncated. NULL reads as `None`.
   pub fn get_long(&self, column: usize) -> Result<Option<i64>> {
      Ok(self.get_value(column)?.as_integer())
   }

   pub fn get_double(&self, column: usize) -> Result<Option<f64>> {
      Ok(self.get_value(column)?.as_real())
   }

   pub fn get_string(&self, column: usize) -> Result<Option<String>> {
      Ok(self.get_value(column)?.to_text())
   }

   pub fn get_blob(&self, column: usize) -> Result<Option<Vec<u8>>> {
      Ok(self.get_value(column)?.as_blob().map(<[u8]>::to_vec))
   }

   /// Forgets the count and window so the next access re-runs the query.
   pub fn requery(&mut self) -> Result<()> {
      self.throw_if_closed()?;
      self.window = None;
      self.count = None;
      self.window_capacity = 0;
      self.position = -1;
      Ok(())
   }

   /// Drops the window and releases the session reference. Idempotent.
   pub fn close(&mut self) {
      if self.closed {
         return;
      }
      self.closed = true;
      self.window = None;
      self.database.release_reference();
   }

   fn throw_if_closed(&self) -> Result<()> {
      if self.closed {
         return Err(Error::ObjectClosed(format!("cursor for {}", trim_sql_for_display(&self.sql))));
      }
      Ok(())
   }

   fn fill_window(&mut self, required_pos: usize) -> Result<()> {
      self.throw_if_closed()?;
      let mut window = self
         .window
         .take()
         .unwrap_or_else(|| CursorWindow::new(trim_sql_for_display(&self.sql), self.window_bytes));
      window.clear();

      let count_all_rows = self.count.is_none();
      let start_pos = pick_fill_window_start_position(required_pos, self.window_capacity);
      let counted = self.database.execute_for_cursor_window(
         &self.sql,
         &self.args,
         &mut window,
         start_pos,
         required_pos,
         count_all_rows,
         self.cancel.as_ref(),
      )?;

      if count_all_rows {
         self.count = Some(counted);
         self.window_capacity = window.num_rows();
      }
      self.window = Some(window);
      Ok(())
   }
}

impl Drop for Cursor {
   fn drop(&mut self) {
      self.close();
   }
}

/// Start row for a window that must contain `required_pos`.
///
/// Places the required row about a third of the way into the window so
/// short moves in either direction stay inside it.
fn pick_fill_window_start_position(required_pos: usize, window_capacity: usize) -> usize {
   required_pos.saturating_sub(window_capacity / 3)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_start_position_without_capacity() {
      assert_eq!(pick_fill_window_start_position(0, 0), 0);
      assert_eq!(pick_fill_window_start_position(42, 0), 42);
   }

   #[test]
   fn test_start_position_keeps_a_third_behind() {
      assert_eq!(pick_fill_window_start_position(50, 30), 40);
      assert_eq!(pick_fill_window_start_position(5, 30), 0);
   }
}
