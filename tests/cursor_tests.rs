//! Integration tests for `Cursor` window paging.

use std::sync::Arc;

use odk_sqlite::{Database, Query};
use odk_sqlite_conn::{DatabaseConfig, OperationLog, OperationRecord, Value};
use tempfile::TempDir;

struct TestDb {
   db: Arc<Database>,
   log: Arc<OperationLog>,
   _dir: TempDir,
}

impl Drop for TestDb {
   fn drop(&mut self) {
      self.db.close();
   }
}

/// Opens a session with `rows` items and a window of `window_bytes`.
///
/// Each row costs about 16 bytes of window space, so 200 bytes hold a dozen rows.
fn open_with_items(rows: i64, window_bytes: usize) -> TestDb {
   let dir = tempfile::tempdir().expect("Failed to create temp directory");
   let log = Arc::new(OperationLog::new("test-app"));
   let config = DatabaseConfig {
      cursor_window_bytes: window_bytes,
      ..DatabaseConfig::new("test-app", dir.path().join("test.db"))
   };
   let db = Database::open(config, "default", Arc::clone(&log)).expect("Failed to open session");

   db.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)", &[], None)
      .unwrap();
   db.begin_transaction_exclusive().unwrap();
   for i in 0..rows {
      db.execute(
         "INSERT INTO items (id, name) VALUES (?, ?)",
         &[Value::from(i), Value::from(format!("item-{i}"))],
         None,
      )
      .unwrap();
   }
   db.set_transaction_successful().unwrap();
   db.end_transaction().unwrap();

   TestDb { db, log, _dir: dir }
}

fn window_fills(log: &OperationLog) -> Vec<OperationRecord> {
   log.recent_operations()
      .into_iter()
      .filter(|op| op.kind == "executeForCursorWindow")
      .collect()
}

fn counted_all(op: &OperationRecord, total: usize) -> bool {
   op.detail
      .as_deref()
      .is_some_and(|d| d.ends_with(&format!("countedRows={total}")))
}

#[test]
fn test_count_is_computed_once_and_cached() {
   let t = open_with_items(100, 200);
   let mut cursor = t
      .db
      .raw_query("SELECT id, name FROM items ORDER BY id", Vec::new(), None)
      .unwrap();

   assert_eq!(cursor.get_count().unwrap(), 100);
   let fills = window_fills(&t.log);
   assert_eq!(fills.len(), 1);
   assert!(counted_all(&fills[0], 100));

   // Inside the first window: no engine call.
   assert!(cursor.move_to_position(5).unwrap());
   assert_eq!(cursor.get_long(0).unwrap(), Some(5));
   assert_eq!(window_fills(&t.log).len(), 1);

   // Outside the window: one plain fill, no recount.
   assert!(cursor.move_to_position(50).unwrap());
   assert_eq!(cursor.get_long(0).unwrap(), Some(50));
   assert_eq!(cursor.get_string(1).unwrap().as_deref(), Some("item-50"));
   let fills = window_fills(&t.log);
   assert_eq!(fills.len(), 2);
   assert!(!counted_all(&fills[0], 100));

   assert_eq!(cursor.get_count().unwrap(), 100);
   assert_eq!(window_fills(&t.log).len(), 2);
   cursor.close();
}

#[test]
fn test_iterates_every_row_across_windows() {
   let t = open_with_items(100, 200);
   let mut cursor = t
      .db
      .query(&Query::table("items").columns(["id", "name"]).order_by("id"), None)
      .unwrap();

   let mut ids = Vec::new();
   while cursor.move_to_next().unwrap() {
      ids.push(cursor.get_long(0).unwrap().unwrap());
   }
   assert_eq!(ids, (0..100).collect::<Vec<i64>>());
   assert!(cursor.is_after_last().unwrap());
   assert!(window_fills(&t.log).len() > 2);

   let mut reversed = Vec::new();
   while cursor.move_to_previous().unwrap() {
      reversed.push(cursor.get_long(0).unwrap().unwrap());
   }
   assert_eq!(reversed, (0..100).rev().collect::<Vec<i64>>());
   assert!(cursor.is_before_first().unwrap());
}

#[test]
fn test_move_bounds() {
   let t = open_with_items(10, 2 * 1024 * 1024);
   let mut cursor = t.db.raw_query("SELECT id FROM items ORDER BY id", Vec::new(), None).unwrap();

   assert_eq!(cursor.position(), -1);
   assert!(cursor.move_to_last().unwrap());
   assert_eq!(cursor.get_long(0).unwrap(), Some(9));
   assert!(cursor.move_to_first().unwrap());
   assert_eq!(cursor.position(), 0);

   assert!(!cursor.move_to_position(10).unwrap());
   assert_eq!(cursor.position(), 10);
   assert!(cursor.get_value(0).is_err());
   assert!(!cursor.move_to_position(-5).unwrap());
   assert_eq!(cursor.position(), -1);
}

#[test]
fn test_empty_result() {
   let t = open_with_items(0, 1024);
   let mut cursor = t.db.raw_query("SELECT id FROM items", Vec::new(), None).unwrap();

   assert_eq!(cursor.get_count().unwrap(), 0);
   assert!(!cursor.move_to_first().unwrap());
   assert!(cursor.is_before_first().unwrap());
   assert!(cursor.is_after_last().unwrap());
}

#[test]
fn test_columns_and_typed_getters() {
   let t = open_with_items(0, 1024);
   t.db
      .execute(
         "INSERT INTO items (id, name) VALUES (?, ?)",
         &[Value::from(1), Value::from("12.5")],
         None,
      )
      .unwrap();
   let mut cursor = t
      .db
      .raw_query(
         "SELECT id, name, NULL AS missing, x'0102' AS data FROM items WHERE id = ?",
         vec![Value::from(1)],
         None,
      )
      .unwrap();

   assert_eq!(cursor.column_names(), ["id", "name", "missing", "data"]);
   assert_eq!(cursor.column_index("NAME"), Some(1));
   assert_eq!(cursor.column_index("items.name"), Some(1));
   assert_eq!(cursor.column_index("nope"), None);
   assert!(cursor.column_index_or_err("nope").is_err());

   assert!(cursor.move_to_first().unwrap());
   assert_eq!(cursor.get_double(1).unwrap(), Some(12.5));
   assert!(cursor.is_null(2).unwrap());
   assert_eq!(cursor.get_string(2).unwrap(), None);
   assert_eq!(cursor.get_blob(3).unwrap(), Some(vec![1, 2]));
   assert!(cursor.get_value(4).is_err());
}

#[test]
fn test_requery_sees_new_rows() {
   let t = open_with_items(3, 1024);
   let mut cursor = t.db.raw_query("SELECT id FROM items", Vec::new(), None).unwrap();
   assert_eq!(cursor.get_count().unwrap(), 3);

   t.db
      .execute("INSERT INTO items (id, name) VALUES (3, 'item-3')", &[], None)
      .unwrap();
   assert_eq!(cursor.get_count().unwrap(), 3);

   cursor.requery().unwrap();
   assert_eq!(cursor.position(), -1);
   assert_eq!(cursor.get_count().unwrap(), 4);
}

#[test]
fn test_failed_fill_discards_window() {
   let t = open_with_items(100, 2 * 1024 * 1024);
   let mut cursor = t
      .db
      .raw_query(
         "SELECT id, CASE WHEN id = 60 THEN abs(id - 9223372036854775807 - 61) ELSE id END FROM items ORDER BY id",
         Vec::new(),
         None,
      )
      .unwrap();

   let err = cursor.get_count().unwrap_err();
   assert_eq!(err.error_code(), "SQLITE_ERROR");
   assert!(cursor.get_value(0).is_err());

   // The session stays usable.
   assert_eq!(t.db.execute_for_long("SELECT count(*) FROM items", &[], None).unwrap(), Some(100));
}

#[test]
fn test_cursor_holds_session_reference() {
   let t = open_with_items(1, 1024);
   assert_eq!(t.db.reference_count(), 1);

   let mut cursor = t.db.raw_query("SELECT id FROM items", Vec::new(), None).unwrap();
   assert_eq!(t.db.reference_count(), 2);

   cursor.close();
   cursor.close();
   assert!(cursor.is_closed());
   assert_eq!(t.db.reference_count(), 1);
   assert!(cursor.get_count().is_err());

   {
      let _dropped = t.db.raw_query("SELECT id FROM items", Vec::new(), None).unwrap();
      assert_eq!(t.db.reference_count(), 2);
   }
   assert_eq!(t.db.reference_count(), 1);
}

#[test]
fn test_cursor_keeps_session_alive_after_close() {
   let t = open_with_items(2, 1024);
   let mut cursor = t.db.raw_query("SELECT id FROM items ORDER BY id", Vec::new(), None).unwrap();

   t.db.close();
   assert!(t.db.is_open());
   assert!(cursor.move_to_last().unwrap());
   assert_eq!(cursor.get_long(0).unwrap(), Some(1));

   cursor.close();
   assert!(!t.db.is_open());
}

#[test]
fn test_invalid_query_is_rejected_before_cursor_exists() {
   let t = open_with_items(0, 1024);
   assert!(t.db.raw_query("SELECT nope FROM items", Vec::new(), None).is_err());
   assert!(t.db.query(&Query::table("items").having("count(*) > 1"), None).is_err());
   assert_eq!(t.db.reference_count(), 1);
}
