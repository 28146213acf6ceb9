//! Per-application registry of open sessions.

use std::fmt::Write;
use std::sync::Arc;

use indexmap::IndexMap;
use odk_sqlite_conn::{DatabaseConfig, OperationLog};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::database::Database;
use crate::{Error, Result};

/// Suffix marking session qualifiers generated for internal bookkeeping.
pub const INTERNAL_SESSION_SUFFIX: &str = "_internal";

/// Summary of an application's sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStats {
   pub app_name: String,
   pub sessions: Vec<String>,
   pub active_connections: u64,
}

/// Sessions and the operation log shared by one application.
///
/// Each session is keyed by its qualifier. The registry owns the reference
/// a session is created with; callers of [`get_or_open`](Self::get_or_open)
/// and [`get_existing`](Self::get_existing) receive an extra reference they
/// must give back with [`Database::release_reference`].
pub struct AppContext {
   app_name: String,
   operation_log: Arc<OperationLog>,
   sessions: Mutex<IndexMap<String, Arc<Database>>>,
}

impl AppContext {
   pub fn new(app_name: impl Into<String>) -> Self {
      let app_name = app_name.into();
      Self {
         operation_log: Arc::new(OperationLog::new(app_name.clone())),
         app_name,
         sessions: Mutex::new(IndexMap::new()),
      }
   }

   /// Closes every session and returns an empty context for the same application.
   pub fn rebuild(self) -> Self {
      let app_name = self.app_name.clone();
      drop(self);
      Self::new(app_name)
   }

   pub fn app_name(&self) -> &str {
      &self.app_name
   }

   pub fn operation_log(&self) -> &Arc<OperationLog> {
      &self.operation_log
   }

   /// Returns the session for `session_qualifier`, opening it if necessary.
   ///
   /// The thread that creates the session opens it; other threads asking
   /// for the same qualifier wait for that to finish. `config` is ignored
   /// when the session already exists.
   pub fn get_or_open(&self, session_qualifier: &str, config: DatabaseConfig) -> Result<Arc<Database>> {
      let (database, created) = {
         let mut sessions = self.sessions.lock();
         match sessions.get(session_qualifier) {
            Some(database) => (Arc::clone(database), false),
            None => {
               let database = Database::new(config, session_qualifier, Arc::clone(&self.operation_log))?;
               sessions.insert(session_qualifier.to_string(), Arc::clone(&database));
               (database, true)
            }
         }
      };

      if created {
         if let Err(e) = database.open_connection() {
            database.signal_initialization_complete(false);
            self.forget(session_qualifier, &database);
            database.close();
            return Err(e);
         }
         database.signal_initialization_complete(true);
         debug!(app = %self.app_name, session = session_qualifier, "Registered session");
      } else if !database.wait_for_initialization_complete() {
         return Err(Error::InitializationFailed(session_qualifier.to_string()));
      }

      database.acquire_reference()?;
      Ok(database)
   }

   /// Returns the session for `session_qualifier` if it is open.
   pub fn get_existing(&self, session_qualifier: &str) -> Option<Arc<Database>> {
      let database = self.sessions.lock().get(session_qualifier).cloned()?;
      database.acquire_reference().ok()?;
      Some(database)
   }

   /// Unregisters a session and releases the registry's reference to it.
   ///
   /// The connection closes once every caller has released theirs. When the
   /// last session goes, the operation log is cleared.
   pub fn remove_session(&self, session_qualifier: &str) -> bool {
      let (database, now_empty) = {
         let mut sessions = self.sessions.lock();
         let database = sessions.shift_remove(session_qualifier);
         (database, sessions.is_empty())
      };
      let Some(database) = database else {
         return false;
      };

      database.close();
      if now_empty {
         self.operation_log.clear();
      }
      debug!(app = %self.app_name, session = session_qualifier, "Removed session");
      true
   }

   /// Qualifiers of the registered sessions, sorted.
   pub fn session_qualifiers(&self) -> Vec<String> {
      let mut qualifiers: Vec<String> = self.sessions.lock().keys().cloned().collect();
      qualifiers.sort();
      qualifiers
   }

   pub fn generate_session_qualifier(&self) -> String {
      Uuid::new_v4().simple().to_string()
   }

   /// Qualifier for sessions opened by the data layer for its own use.
   pub fn generate_internal_session_qualifier(&self) -> String {
      format!("{}{INTERNAL_SESSION_SUFFIX}", Uuid::new_v4().simple())
   }

   pub fn stats(&self) -> ContextStats {
      ContextStats {
         app_name: self.app_name.clone(),
         sessions: self.session_qualifiers(),
         active_connections: self.operation_log.active_connections(),
      }
   }

   /// Human-readable dump of the operation log and every session.
   pub fn dump_info(&self, verbose: bool) -> String {
      let mut out = String::new();
      let _ = writeln!(out, "\n---------------- {} ---------------------\n", self.app_name);
      self.operation_log.dump(&mut out, verbose);
      let _ = writeln!(out, "-----active------------------\n");

      let sessions: Vec<Arc<Database>> = self.sessions.lock().values().cloned().collect();
      for database in sessions {
         database.dump(&mut out, verbose);
         let _ = writeln!(out, "\n-------");
      }
      let _ = writeln!(out, "\n-------------------------------------\n");
      out
   }

   /// Closes every registered session.
   pub fn close_all(&self) {
      let sessions: Vec<(String, Arc<Database>)> = self.sessions.lock().drain(..).collect();
      for (session_qualifier, database) in sessions {
         database.close();
         debug!(app = %self.app_name, session = %session_qualifier, "Closed session on shutdown");
      }
      self.operation_log.clear();
   }

   fn forget(&self, session_qualifier: &str, database: &Arc<Database>) {
      let mut sessions = self.sessions.lock();
      if sessions
         .get(session_qualifier)
         .is_some_and(|registered| Arc::ptr_eq(registered, database))
      {
         sessions.shift_remove(session_qualifier);
      }
   }
}

impl Drop for AppContext {
   fn drop(&mut self) {
      self.close_all();
   }
}
