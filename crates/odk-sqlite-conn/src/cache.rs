//! Per-connection LRU cache of compiled statements.
//!
//! Statements live in an arena of slots. The LRU map (`IndexMap`, oldest entry
//! first) points at slots by index, and finalized slots go onto a free list to
//! be re-initialized by the next compile. While a statement executes, its
//! native handle is moved out of the slot into the [`AcquiredStatement`], so
//! the cache lock is never held across a step. Every path that drops a
//! statement funnels through [`CacheState::recycle`] or `release`, so a native
//! statement is finalized exactly once.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Write;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::native::{NativeConnection, NativeStatement};
use crate::statement::{StatementKind, trim_sql_for_display};

/// A statement checked out of the cache for one execution.
///
/// Must be handed back with [`PreparedStatementCache::release`].
#[must_use = "acquired statements must be released back to the cache"]
pub(crate) struct AcquiredStatement {
   slot: usize,
   pub(crate) native: NativeStatement,
   pub(crate) num_parameters: usize,
   pub(crate) read_only: bool,
}

/// Hit, miss and size counters of a statement cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
   pub hit_count: u64,
   pub miss_count: u64,
   pub size: usize,
   pub max_size: usize,
}

#[derive(Default)]
struct Slot {
   sql: String,
   native: Option<NativeStatement>,
   address: usize,
   num_parameters: usize,
   kind: Option<StatementKind>,
   read_only: bool,
   in_use: bool,
}

struct CacheState {
   max_size: usize,
   lru: IndexMap<String, usize>,
   slots: Vec<Slot>,
   free: Vec<usize>,
   hit_count: u64,
   miss_count: u64,
}

/// Bounded statement cache keyed by SQL text.
pub struct PreparedStatementCache {
   state: Mutex<CacheState>,
}

impl PreparedStatementCache {
   /// A cache holding at most `max_size` statements. Zero disables caching.
   pub fn new(max_size: usize) -> Self {
      Self {
         state: Mutex::new(CacheState {
            max_size,
            lru: IndexMap::with_capacity(max_size),
            slots: Vec::new(),
            free: Vec::new(),
            hit_count: 0,
            miss_count: 0,
         }),
      }
   }

   /// Checks out a compiled statement for `sql`, compiling one if needed.
   ///
   /// A cached statement that is already in use (a reentrant call running the
   /// same SQL) is left alone and a fresh, uncached statement is compiled.
   pub(crate) fn acquire(&self, native: &NativeConnection, sql: &str) -> Result<AcquiredStatement> {
      let mut state = self.state.lock();

      let existing = state.get(sql);
      if let Some(slot) = existing
         && !state.slots[slot].in_use
         && let Some(native) = state.slots[slot].native.take()
      {
         state.hit_count += 1;
         state.slots[slot].in_use = true;
         return Ok(state.checkout(slot, native));
      }
      state.miss_count += 1;

      let statement = native.prepare(sql)?;
      let kind = StatementKind::classify(sql);
      if kind == StatementKind::Ddl {
         // Schema changes invalidate every compiled statement.
         state.evict_all();
      }

      let slot = state.obtain_slot(sql, &statement, kind);
      if existing.is_none() && kind.is_cacheable() && state.max_size > 0 {
         state.insert(sql, slot);
      }
      Ok(state.checkout(slot, statement))
   }

   /// Returns a statement after execution.
   ///
   /// Cached statements are reset for reuse; anything else is finalized and
   /// its slot parked on the free list. A reset failure evicts the statement.
   pub(crate) fn release(&self, statement: AcquiredStatement) {
      let AcquiredStatement { slot, native, .. } = statement;
      let mut state = self.state.lock();

      if !state.is_mapped(slot) {
         finalize(native, &state.slots[slot].sql);
         state.recycle(slot);
         return;
      }

      match native.reset_and_clear() {
         Ok(()) => {
            let entry = &mut state.slots[slot];
            entry.native = Some(native);
            entry.in_use = false;
         }
         Err(e) => {
            let sql = state.slots[slot].sql.clone();
            warn!(sql = %trim_sql_for_display(&sql), error = %e, "Could not reset statement, evicting it");
            finalize(native, &sql);
            state.lru.shift_remove(&sql);
            state.recycle(slot);
         }
      }
   }

   /// Evicts every cached statement.
   pub fn evict_all(&self) {
      self.state.lock().evict_all();
   }

   /// Evicts everything for disposal.
   ///
   /// Statements still checked out are no longer mapped once this returns, so
   /// their `release` finalizes them.
   pub(crate) fn finalize_all(&self) {
      let mut state = self.state.lock();
      state.evict_all();
      for entry in state.slots.iter().filter(|entry| entry.in_use) {
         warn!(sql = %trim_sql_for_display(&entry.sql), "Statement still in use while the connection is disposed");
      }
   }

   pub fn stats(&self) -> CacheStats {
      let state = self.state.lock();
      CacheStats {
         hit_count: state.hit_count,
         miss_count: state.miss_count,
         size: state.lru.len(),
         max_size: state.max_size,
      }
   }

   /// SQL of cached statements, least recently used first.
   pub fn cached_sql(&self) -> Vec<String> {
      self.state.lock().lru.keys().cloned().collect()
   }

   pub fn contains(&self, sql: &str) -> bool {
      self.state.lock().lru.contains_key(sql)
   }

   /// Number of finalized statement shells waiting for reuse.
   pub fn pooled(&self) -> usize {
      self.state.lock().free.len()
   }

   /// Number of live native statements, cached or checked out.
   pub fn live_statements(&self) -> usize {
      let state = self.state.lock();
      state
         .slots
         .iter()
         .filter(|slot| slot.native.is_some() || slot.in_use)
         .count()
   }

   /// Number of statements currently checked out for `sql`.
   pub fn in_use_count(&self, sql: &str) -> usize {
      let state = self.state.lock();
      state.slots.iter().filter(|slot| slot.in_use && slot.sql == sql).count()
   }

   pub(crate) fn dump(&self, out: &mut String) {
      let state = self.state.lock();
      let _ = writeln!(out, "  Prepared statement cache:");
      if state.lru.is_empty() {
         let _ = writeln!(out, "    <none>");
         return;
      }
      for (i, (sql, &slot)) in state.lru.iter().enumerate() {
         let entry = &state.slots[slot];
         let address = entry.address;
         let kind = entry.kind.unwrap_or(StatementKind::Other);
         let _ = writeln!(
            out,
            "    {i}: statementPtr=0x{address:x}, numParameters={}, type={kind}, readOnly={}, sql=\"{}\"",
            entry.num_parameters,
            entry.read_only,
            trim_sql_for_display(sql),
         );
      }
   }
}

impl CacheState {
   /// Looks `sql` up and marks it most recently used.
   fn get(&mut self, sql: &str) -> Option<usize> {
      let index = self.lru.get_index_of(sql)?;
      let last = self.lru.len() - 1;
      self.lru.move_index(index, last);
      self.lru.get(sql).copied()
   }

   fn is_mapped(&self, slot: usize) -> bool {
      self.lru.get(&self.slots[slot].sql) == Some(&slot)
   }

   fn checkout(&self, slot: usize, native: NativeStatement) -> AcquiredStatement {
      let entry = &self.slots[slot];
      AcquiredStatement {
         slot,
         native,
         num_parameters: entry.num_parameters,
         read_only: entry.read_only,
      }
   }

   /// Re-initializes a pooled shell, or allocates one if the pool is empty.
   fn obtain_slot(&mut self, sql: &str, native: &NativeStatement, kind: StatementKind) -> usize {
      let slot = match self.free.pop() {
         Some(slot) => slot,
         None => {
            self.slots.push(Slot::default());
            self.slots.len() - 1
         }
      };
      let entry = &mut self.slots[slot];
      entry.sql.clear();
      entry.sql.push_str(sql);
      entry.num_parameters = native.parameter_count();
      entry.read_only = native.is_read_only();
      entry.kind = Some(kind);
      entry.address = native.address();
      entry.native = None;
      entry.in_use = true;
      slot
   }

   /// Inserts as most recently used, evicting the eldest entries beyond capacity.
   fn insert(&mut self, sql: &str, slot: usize) {
      self.lru.insert(sql.to_string(), slot);
      while self.lru.len() > self.max_size {
         let Some((evicted_sql, evicted)) = self.lru.shift_remove_index(0) else {
            break;
         };
         debug!(sql = %trim_sql_for_display(&evicted_sql), "Evicting statement from cache");
         self.entry_removed(evicted);
      }
   }

   /// Eviction callback. In-use statements are finalized later by `release`.
   fn entry_removed(&mut self, slot: usize) {
      if !self.slots[slot].in_use {
         self.recycle(slot);
      }
   }

   fn evict_all(&mut self) {
      let evicted: Vec<usize> = self.lru.drain(..).map(|(_, slot)| slot).collect();
      for slot in evicted {
         self.entry_removed(slot);
      }
   }

   /// Finalizes the slot's native statement and parks the shell on the free list.
   fn recycle(&mut self, slot: usize) {
      let entry = &mut self.slots[slot];
      if let Some(native) = entry.native.take() {
         finalize(native, &entry.sql);
      }
      entry.sql.clear();
      entry.address = 0;
      entry.kind = None;
      entry.in_use = false;
      if !self.free.contains(&slot) {
         self.free.push(slot);
      }
   }
}

fn finalize(native: NativeStatement, sql: &str) {
   if let Err(e) = native.finalize() {
      trace!(sql = %trim_sql_for_display(sql), error = %e, "Finalize reported an earlier failure");
   }
}
