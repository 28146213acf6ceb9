//! In-memory ring of recent operations, for diagnostics only.
//!
//! Each application shares one log across its connections. Entries are
//! addressed by cookies (`generation << 8 | index`); a cookie whose slot has
//! since been reused no longer matches and is ignored. Open and close calls
//! are tallied into eight buckets of 8192 ms, giving the last ~65 seconds of
//! activity.

use parking_lot::Mutex;
use std::fmt::Write;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::info;

use crate::error::Error;
use crate::statement::trim_sql_for_display;
use crate::value::Value;

const MAX_RECENT_OPERATIONS: usize = 60;
const COOKIE_GENERATION_SHIFT: u32 = 8;
const COOKIE_INDEX_MASK: u32 = 0xff;
const OPEN_CLOSE_BUCKETS: usize = 8;
const OPEN_CLOSE_BUCKET_SHIFT: u32 = 13;
const SLOW_OPERATION_THRESHOLD: Duration = Duration::from_secs(10);

/// Snapshot of one logged operation.
#[derive(Debug, Clone)]
pub struct OperationRecord {
   pub kind: &'static str,
   pub session_qualifier: String,
   pub sql: String,
   pub bind_args: Vec<Value>,
   pub thread: String,
   pub start_time: OffsetDateTime,
   started: Instant,
   pub duration: Option<Duration>,
   pub error: Option<String>,
   pub detail: Option<String>,
   /// Native executions performed by the operation. Zero when it failed before
   /// reaching the engine.
   pub engine_calls: u32,
}

impl OperationRecord {
   pub fn is_finished(&self) -> bool {
      self.duration.is_some()
   }

   pub fn succeeded(&self) -> bool {
      self.is_finished() && self.error.is_none()
   }

   fn status(&self) -> &'static str {
      match (&self.duration, &self.error) {
         (None, _) => "running",
         (Some(_), Some(_)) => "failed",
         (Some(_), None) => "succeeded",
      }
   }

   /// One-entry description used by dumps and log events.
   pub fn describe(&self, verbose: bool) -> String {
      let mut out = String::new();
      match self.duration {
         Some(duration) => {
            let _ = write!(out, "{} took {}ms", self.kind, duration.as_millis());
         }
         None => {
            let _ = write!(out, "{} started {}ms ago", self.kind, self.started.elapsed().as_millis());
         }
      }
      let _ = write!(
         out,
         " - {}\n      threadId:{}, sessionQualifier:{}, startTime:{}",
         self.status(),
         self.thread,
         self.session_qualifier,
         format_start_time(self.start_time),
      );
      if !self.sql.is_empty() {
         let _ = write!(out, ", sql=\"{}\"", trim_sql_for_display(&self.sql));
      }
      if verbose && !self.bind_args.is_empty() {
         let args: Vec<String> = self.bind_args.iter().map(Value::describe).collect();
         let _ = write!(out, ", bindArgs=[{}]", args.join(", "));
      }
      if let Some(error) = &self.error {
         let _ = write!(out, ", throwable=\"{error}\"");
      }
      if let Some(detail) = &self.detail {
         let _ = write!(out, ", {detail}");
      }
      out
   }
}

fn format_start_time(time: OffsetDateTime) -> String {
   let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");
   time.format(&format).unwrap_or_else(|_| time.to_string())
}

#[derive(Debug, Clone, Copy, Default)]
struct OpenCloseBucket {
   epoch: u64,
   opens: u64,
   closes: u64,
}

struct Slot {
   cookie: u32,
   record: OperationRecord,
}

struct LogState {
   slots: Vec<Option<Slot>>,
   index: usize,
   generation: u32,
   buckets: [OpenCloseBucket; OPEN_CLOSE_BUCKETS],
   total_opens: u64,
   total_closes: u64,
}

impl LogState {
   fn record_mut(&mut self, cookie: u32) -> Option<&mut OperationRecord> {
      let index = (cookie & COOKIE_INDEX_MASK) as usize;
      match self.slots.get_mut(index) {
         Some(Some(slot)) if slot.cookie == cookie => Some(&mut slot.record),
         _ => None,
      }
   }

   /// Records newest first.
   fn newest_first(&self) -> impl Iterator<Item = &Slot> {
      (0..MAX_RECENT_OPERATIONS)
         .map(move |n| (self.index + MAX_RECENT_OPERATIONS - n) % MAX_RECENT_OPERATIONS)
         .filter_map(move |i| self.slots[i].as_ref())
   }

   fn bucket_mut(&mut self) -> &mut OpenCloseBucket {
      let epoch = now_millis() >> OPEN_CLOSE_BUCKET_SHIFT;
      let bucket = &mut self.buckets[(epoch % OPEN_CLOSE_BUCKETS as u64) as usize];
      if bucket.epoch != epoch {
         *bucket = OpenCloseBucket {
            epoch,
            ..OpenCloseBucket::default()
         };
      }
      bucket
   }
}

fn now_millis() -> u64 {
   SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map_or(0, |d| d.as_millis() as u64)
}

/// Recent operations of one application.
pub struct OperationLog {
   app_name: String,
   state: Mutex<LogState>,
}

impl OperationLog {
   pub fn new(app_name: impl Into<String>) -> Self {
      Self {
         app_name: app_name.into(),
         state: Mutex::new(LogState {
            slots: (0..MAX_RECENT_OPERATIONS).map(|_| None).collect(),
            index: MAX_RECENT_OPERATIONS - 1,
            generation: 0,
            buckets: [OpenCloseBucket::default(); OPEN_CLOSE_BUCKETS],
            total_opens: 0,
            total_closes: 0,
         }),
      }
   }

   pub fn app_name(&self) -> &str {
      &self.app_name
   }

   /// Starts an entry and returns its cookie.
   pub fn begin_operation(&self, session_qualifier: &str, kind: &'static str, sql: &str, bind_args: &[Value]) -> u32 {
      let mut state = self.state.lock();
      state.index = (state.index + 1) % MAX_RECENT_OPERATIONS;
      state.generation = state.generation.wrapping_add(1);
      let cookie = (state.generation << COOKIE_GENERATION_SHIFT) | state.index as u32;
      let thread = std::thread::current();
      let record = OperationRecord {
         kind,
         session_qualifier: session_qualifier.to_string(),
         sql: sql.to_string(),
         bind_args: bind_args.iter().map(Value::redacted).collect(),
         thread: match thread.name() {
            Some(name) => format!("{:?} ({name})", thread.id()),
            None => format!("{:?}", thread.id()),
         },
         start_time: OffsetDateTime::now_utc(),
         started: Instant::now(),
         duration: None,
         error: None,
         detail: None,
         engine_calls: 0,
      };
      let index = state.index;
      state.slots[index] = Some(Slot { cookie, record });
      cookie
   }

   /// Counts one native execution against the entry.
   pub fn note_engine_call(&self, cookie: u32) {
      if let Some(record) = self.state.lock().record_mut(cookie) {
         record.engine_calls += 1;
      }
   }

   /// Attaches extra detail (row counts, window positions) shown in dumps.
   pub fn set_detail(&self, cookie: u32, detail: String) {
      if let Some(record) = self.state.lock().record_mut(cookie) {
         record.detail = Some(detail);
      }
   }

   /// Records a failure. Logged immediately; `end_operation` still follows.
   pub fn fail_operation(&self, cookie: u32, error: &Error) {
      let mut state = self.state.lock();
      if let Some(record) = state.record_mut(cookie) {
         record.error = Some(error.to_string());
         if !error.is_canceled() {
            let description = record.describe(false);
            info!(app = %self.app_name, "failOperation: {description}");
         }
      }
   }

   pub fn end_operation(&self, cookie: u32) {
      let mut state = self.state.lock();
      if let Some(record) = state.record_mut(cookie)
         && record.duration.is_none()
      {
         let duration = record.started.elapsed();
         record.duration = Some(duration);
         if duration >= SLOW_OPERATION_THRESHOLD {
            let description = record.describe(false);
            info!(app = %self.app_name, elapsed_ms = duration.as_millis() as u64, "Slow operation: {description}");
         }
      }
   }

   pub fn tick_open(&self) {
      let mut state = self.state.lock();
      state.total_opens += 1;
      state.bucket_mut().opens += 1;
   }

   pub fn tick_close(&self) {
      let mut state = self.state.lock();
      state.total_closes += 1;
      state.bucket_mut().closes += 1;
   }

   /// Description of the newest entry still running.
   pub fn describe_current_operation(&self) -> Option<String> {
      let state = self.state.lock();
      state
         .newest_first()
         .find(|slot| !slot.record.is_finished())
         .map(|slot| slot.record.describe(false))
   }

   /// Snapshot of the recorded operations, newest first.
   pub fn recent_operations(&self) -> Vec<OperationRecord> {
      let state = self.state.lock();
      state.newest_first().map(|slot| slot.record.clone()).collect()
   }

   /// Opens minus closes since the log was created.
   pub fn active_connections(&self) -> u64 {
      let state = self.state.lock();
      state.total_opens.saturating_sub(state.total_closes)
   }

   pub fn clear(&self) {
      let mut state = self.state.lock();
      state.slots.iter_mut().for_each(|slot| *slot = None);
      state.index = MAX_RECENT_OPERATIONS - 1;
   }

   pub fn dump(&self, out: &mut String, verbose: bool) {
      let state = self.state.lock();
      let current_epoch = now_millis() >> OPEN_CLOSE_BUCKET_SHIFT;
      let (opens, closes) = state
         .buckets
         .iter()
         .filter(|b| current_epoch.saturating_sub(b.epoch) < OPEN_CLOSE_BUCKETS as u64)
         .fold((0, 0), |(o, c), b| (o + b.opens, c + b.closes));

      let _ = writeln!(out, "Operation log for app '{}':", self.app_name);
      let _ = writeln!(out, "  Last 65 seconds of open and close activity");
      let _ = writeln!(out, "    opens: {opens} closes: {closes}");
      let _ = writeln!(
         out,
         "  Total opens: {} closes: {} currently active: {}",
         state.total_opens,
         state.total_closes,
         state.total_opens.saturating_sub(state.total_closes),
      );
      let _ = writeln!(out, "  Most recently executed operations:");
      let mut any = false;
      for (n, slot) in state.newest_first().enumerate() {
         any = true;
         let _ = writeln!(out, "    {n}: [{}]", slot.record.describe(verbose));
      }
      if !any {
         let _ = writeln!(out, "    <none>");
      }
   }
}
