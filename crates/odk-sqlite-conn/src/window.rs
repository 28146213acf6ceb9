//! Bounded buffer holding a contiguous slice of a result set.

use crate::value::Value;

/// A cursor window: rows `[start_position, start_position + num_rows())` of a query.
///
/// Capacity is a byte budget, optionally combined with a row limit. A row that
/// does not fit is rejected whole; the window never holds partial rows.
#[derive(Debug, Clone)]
pub struct CursorWindow {
   name: String,
   start_position: usize,
   num_columns: usize,
   rows: Vec<Vec<Value>>,
   capacity_bytes: usize,
   max_rows: Option<usize>,
   used_bytes: usize,
}

impl CursorWindow {
   pub fn new(name: impl Into<String>, capacity_bytes: usize) -> Self {
      Self {
         name: name.into(),
         start_position: 0,
         num_columns: 0,
         rows: Vec::new(),
         capacity_bytes,
         max_rows: None,
         used_bytes: 0,
      }
   }

   /// Window limited by row count instead of bytes.
   pub fn with_row_limit(name: impl Into<String>, max_rows: usize) -> Self {
      Self {
         max_rows: Some(max_rows),
         ..Self::new(name, usize::MAX)
      }
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub fn start_position(&self) -> usize {
      self.start_position
   }

   pub fn set_start_position(&mut self, position: usize) {
      self.start_position = position;
   }

   pub fn num_rows(&self) -> usize {
      self.rows.len()
   }

   pub fn num_columns(&self) -> usize {
      self.num_columns
   }

   /// Drops all rows and resets the start position and column count.
   pub fn clear(&mut self) {
      self.rows.clear();
      self.used_bytes = 0;
      self.start_position = 0;
      self.num_columns = 0;
   }

   pub(crate) fn set_num_columns(&mut self, num_columns: usize) {
      self.num_columns = num_columns;
   }

   pub(crate) fn clear_rows(&mut self) {
      self.rows.clear();
      self.used_bytes = 0;
   }

   /// Appends a row, returning false if the window is full.
   pub(crate) fn push_row(&mut self, row: Vec<Value>) -> bool {
      if self.max_rows.is_some_and(|max| self.rows.len() >= max) {
         return false;
      }
      let size: usize = row.iter().map(Value::footprint).sum();
      if self.used_bytes.saturating_add(size) > self.capacity_bytes {
         return false;
      }
      self.used_bytes += size;
      self.rows.push(row);
      true
   }

   /// True if `position` (an absolute row index) is held by this window.
   pub fn contains_position(&self, position: usize) -> bool {
      position >= self.start_position && position < self.start_position + self.rows.len()
   }

   /// Row at absolute `position`.
   pub fn row(&self, position: usize) -> Option<&[Value]> {
      let offset = position.checked_sub(self.start_position)?;
      self.rows.get(offset).map(Vec::as_slice)
   }

   pub fn value(&self, position: usize, column: usize) -> Option<&Value> {
      self.row(position)?.get(column)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_row_limit() {
      let mut window = CursorWindow::with_row_limit("w", 2);
      assert!(window.push_row(vec![Value::Integer(1)]));
      assert!(window.push_row(vec![Value::Integer(2)]));
      assert!(!window.push_row(vec![Value::Integer(3)]));
      assert_eq!(window.num_rows(), 2);
   }

   #[test]
   fn test_byte_limit_rejects_whole_row() {
      let mut window = CursorWindow::new("w", 20);
      assert!(window.push_row(vec![Value::Text("0123456789".into())]));
      assert!(!window.push_row(vec![Value::Text("0123456789".into())]));
      assert_eq!(window.num_rows(), 1);
   }

   #[test]
   fn test_absolute_positions() {
      let mut window = CursorWindow::with_row_limit("w", 10);
      window.set_start_position(5);
      window.push_row(vec![Value::Integer(50)]);
      window.push_row(vec![Value::Integer(60)]);
      assert!(!window.contains_position(4));
      assert!(window.contains_position(5));
      assert!(window.contains_position(6));
      assert!(!window.contains_position(7));
      assert_eq!(window.value(6, 0), Some(&Value::Integer(60)));
      assert_eq!(window.row(4), None);
   }

   #[test]
   fn test_clear_resets_everything() {
      let mut window = CursorWindow::with_row_limit("w", 1);
      window.set_num_columns(3);
      window.set_start_position(9);
      window.push_row(vec![Value::Null; 3]);
      window.clear();
      assert_eq!(window.num_rows(), 0);
      assert_eq!(window.num_columns(), 0);
      assert_eq!(window.start_position(), 0);
      assert!(window.push_row(vec![Value::Null]));
   }
}
