//! Transaction stack bookkeeping for a session
//!
//! Frames live in an arena and are linked to their parent by index. Popped
//! frames go on a free list and are reused by the next begin.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Locking behavior of the native `BEGIN` issued for an outermost transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
   /// Locks are taken on first read or write.
   #[default]
   Deferred,
   /// A write lock is taken immediately; readers may continue.
   Immediate,
   /// A write lock is taken immediately.
   Exclusive,
}

impl TransactionMode {
   pub(crate) fn begin_sql(self) -> &'static str {
      match self {
         TransactionMode::Deferred => "BEGIN;",
         TransactionMode::Immediate => "BEGIN IMMEDIATE;",
         TransactionMode::Exclusive => "BEGIN EXCLUSIVE;",
      }
   }

   /// Mode named by raw `BEGIN` text such as `BEGIN IMMEDIATE TRANSACTION`.
   pub(crate) fn from_begin_sql(sql: &str) -> Self {
      let mut words = sql
         .split(|c: char| c.is_whitespace() || c == ';')
         .filter(|w| !w.is_empty())
         .skip(1);
      match words.next() {
         Some(w) if w.eq_ignore_ascii_case("IMMEDIATE") => TransactionMode::Immediate,
         Some(w) if w.eq_ignore_ascii_case("EXCLUSIVE") => TransactionMode::Exclusive,
         _ => TransactionMode::Deferred,
      }
   }
}

impl fmt::Display for TransactionMode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         TransactionMode::Deferred => "DEFERRED",
         TransactionMode::Immediate => "IMMEDIATE",
         TransactionMode::Exclusive => "EXCLUSIVE",
      };
      f.write_str(name)
   }
}

/// Hooks invoked as a transaction begins and ends.
///
/// Hooks run on the thread that drives the transaction, with the session's
/// transaction lock held. They may run SQL on the same session.
pub trait TransactionListener: Send + Sync {
   /// Called after the transaction has begun. An error aborts the begin.
   fn on_begin(&self) -> Result<()> {
      Ok(())
   }

   /// Called before the transaction commits. An error forces a rollback.
   fn on_commit(&self) -> Result<()> {
      Ok(())
   }

   /// Called before the transaction rolls back.
   fn on_rollback(&self) -> Result<()> {
      Ok(())
   }
}

struct Frame {
   parent: Option<usize>,
   mode: TransactionMode,
   listener: Option<Arc<dyn TransactionListener>>,
   marked_successful: bool,
   child_failed: bool,
}

/// Outcome the innermost transaction would have if it ended now.
pub(crate) struct PendingEnd {
   pub successful: bool,
   pub listener: Option<Arc<dyn TransactionListener>>,
}

#[derive(Default)]
pub(crate) struct TransactionStack {
   frames: Vec<Frame>,
   free: Vec<usize>,
   top: Option<usize>,
   depth: usize,
}

impl TransactionStack {
   pub fn is_empty(&self) -> bool {
      self.top.is_none()
   }

   pub fn depth(&self) -> usize {
      self.depth
   }

   /// Frames parked on the free list.
   #[cfg(test)]
   pub fn pooled(&self) -> usize {
      self.free.len()
   }

   pub fn top_mode(&self) -> Option<TransactionMode> {
      self.top.map(|i| self.frames[i].mode)
   }

   pub fn is_top_marked_successful(&self) -> bool {
      self.top.is_some_and(|i| self.frames[i].marked_successful)
   }

   pub fn push(&mut self, mode: TransactionMode, listener: Option<Arc<dyn TransactionListener>>) {
      let frame = Frame {
         parent: self.top,
         mode,
         listener,
         marked_successful: false,
         child_failed: false,
      };
      let index = match self.free.pop() {
         Some(index) => {
            self.frames[index] = frame;
            index
         }
         None => {
            self.frames.push(frame);
            self.frames.len() - 1
         }
      };
      self.top = Some(index);
      self.depth += 1;
   }

   pub fn mark_successful(&mut self) -> Result<()> {
      let top = self.top.ok_or(Error::NoTransaction)?;
      let frame = &mut self.frames[top];
      if frame.marked_successful {
         return Err(Error::TransactionMarkedSuccessful);
      }
      frame.marked_successful = true;
      Ok(())
   }

   pub fn pending_end(&self) -> Result<PendingEnd> {
      let top = self.top.ok_or(Error::NoTransaction)?;
      let frame = &self.frames[top];
      Ok(PendingEnd {
         successful: frame.marked_successful && !frame.child_failed,
         listener: frame.listener.clone(),
      })
   }

   /// Pops the innermost frame, returning true if it was the outermost.
   ///
   /// An unsuccessful child marks its parent as failed.
   pub fn pop(&mut self, successful: bool) -> Result<bool> {
      let top = self.top.ok_or(Error::NoTransaction)?;
      let parent = self.frames[top].parent;
      self.frames[top].listener = None;
      self.free.push(top);
      self.top = parent;
      self.depth -= 1;

      match parent {
         Some(parent) => {
            if !successful {
               self.frames[parent].child_failed = true;
            }
            Ok(false)
         }
         None => Ok(true),
      }
   }

   /// Discards every open frame, returning how many there were.
   pub fn clear(&mut self) -> usize {
      let depth = self.depth;
      while let Some(top) = self.top {
         self.top = self.frames[top].parent;
         self.frames[top].listener = None;
         self.free.push(top);
      }
      self.depth = 0;
      depth
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_begin_sql_per_mode() {
      assert_eq!(TransactionMode::Deferred.begin_sql(), "BEGIN;");
      assert_eq!(TransactionMode::Immediate.begin_sql(), "BEGIN IMMEDIATE;");
      assert_eq!(TransactionMode::Exclusive.begin_sql(), "BEGIN EXCLUSIVE;");
   }

   #[test]
   fn test_mode_from_raw_begin() {
      assert_eq!(TransactionMode::from_begin_sql("BEGIN;"), TransactionMode::Deferred);
      assert_eq!(TransactionMode::from_begin_sql("  begin immediate"), TransactionMode::Immediate);
      assert_eq!(
         TransactionMode::from_begin_sql("BEGIN EXCLUSIVE TRANSACTION;"),
         TransactionMode::Exclusive
      );
      assert_eq!(TransactionMode::from_begin_sql("BEGIN TRANSACTION"), TransactionMode::Deferred);
   }

   #[test]
   fn test_nested_failure_marks_parent() {
      let mut stack = TransactionStack::default();
      stack.push(TransactionMode::Exclusive, None);
      stack.push(TransactionMode::Deferred, None);
      assert_eq!(stack.depth(), 2);

      assert!(!stack.pop(false).unwrap());
      stack.mark_successful().unwrap();
      let pending = stack.pending_end().unwrap();
      assert!(!pending.successful, "a failed child must fail the parent");
      assert!(stack.pop(pending.successful).unwrap());
      assert!(stack.is_empty());
   }

   #[test]
   fn test_successful_child_leaves_parent_clean() {
      let mut stack = TransactionStack::default();
      stack.push(TransactionMode::Deferred, None);
      stack.push(TransactionMode::Deferred, None);
      stack.mark_successful().unwrap();
      let child = stack.pending_end().unwrap();
      assert!(child.successful);
      stack.pop(child.successful).unwrap();

      stack.mark_successful().unwrap();
      assert!(stack.pending_end().unwrap().successful);
   }

   #[test]
   fn test_mark_successful_twice_fails() {
      let mut stack = TransactionStack::default();
      assert!(matches!(stack.mark_successful(), Err(Error::NoTransaction)));

      stack.push(TransactionMode::Deferred, None);
      stack.mark_successful().unwrap();
      assert!(stack.is_top_marked_successful());
      assert!(matches!(stack.mark_successful(), Err(Error::TransactionMarkedSuccessful)));
   }

   #[test]
   fn test_frames_are_reused() {
      let mut stack = TransactionStack::default();
      stack.push(TransactionMode::Deferred, None);
      stack.push(TransactionMode::Immediate, None);
      stack.pop(true).unwrap();
      stack.pop(true).unwrap();
      assert_eq!(stack.pooled(), 2);

      stack.push(TransactionMode::Exclusive, None);
      assert_eq!(stack.pooled(), 1);
      assert_eq!(stack.top_mode(), Some(TransactionMode::Exclusive));
      assert!(!stack.is_top_marked_successful(), "reused frame must start clean");
   }

   #[test]
   fn test_clear_discards_all_frames() {
      let mut stack = TransactionStack::default();
      stack.push(TransactionMode::Deferred, None);
      stack.push(TransactionMode::Deferred, None);
      stack.push(TransactionMode::Deferred, None);
      assert_eq!(stack.clear(), 3);
      assert!(stack.is_empty());
      assert_eq!(stack.pooled(), 3);
      assert!(matches!(stack.pop(true), Err(Error::NoTransaction)));
   }

   #[test]
   fn test_mode_serde() {
      let mode: TransactionMode = serde_json::from_str("\"immediate\"").unwrap();
      assert_eq!(mode, TransactionMode::Immediate);
      assert_eq!(mode.to_string(), "IMMEDIATE");
   }
}
