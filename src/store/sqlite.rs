//! SQLite-backed keyed store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use super::{KeyedRecord, KeyedStore};
use crate::error::StoreError;

/// Base schema. Records live in one table partitioned by name; the
/// partitions table makes empty partitions enumerable; store_meta holds the
/// schema version for the open-time gate.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS keyed_records (
    partition_name TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition_name, key)
);

CREATE INDEX IF NOT EXISTS idx_keyed_records_partition
    ON keyed_records(partition_name);
"#;

/// SQLite-backed [`KeyedStore`].
///
/// The connection sits behind a mutex, so conflicting writes to the same
/// key are serialized here; last write wins.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the named store at the default location.
  ///
  /// Opening with a version above the persisted one runs `on_upgrade` once
  /// with (old, new) before the version is bumped; opening below the
  /// persisted version fails with [`StoreError::VersionConflict`].
  pub fn open<F>(name: &str, version: u32, on_upgrade: F) -> Result<Self, StoreError>
  where
    F: FnOnce(&Connection, u32, u32) -> rusqlite::Result<()>,
  {
    let path = Self::default_path(name)?;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StoreError::Backend(format!("failed to create store directory: {}", e)))?;
    }

    let conn = Connection::open(&path).map_err(map_sqlite_err)?;
    Self::from_connection(name, conn, version, on_upgrade)
  }

  /// In-memory store for tests and ephemeral runs.
  pub fn open_in_memory<F>(version: u32, on_upgrade: F) -> Result<Self, StoreError>
  where
    F: FnOnce(&Connection, u32, u32) -> rusqlite::Result<()>,
  {
    let conn = Connection::open_in_memory().map_err(map_sqlite_err)?;
    Self::from_connection(":memory:", conn, version, on_upgrade)
  }

  fn from_connection<F>(
    name: &str,
    conn: Connection,
    version: u32,
    on_upgrade: F,
  ) -> Result<Self, StoreError>
  where
    F: FnOnce(&Connection, u32, u32) -> rusqlite::Result<()>,
  {
    conn.execute_batch(STORE_SCHEMA).map_err(map_sqlite_err)?;

    let persisted: u32 = conn
      .query_row("SELECT version FROM store_meta WHERE id = 1", [], |row| {
        row.get(0)
      })
      .unwrap_or(0);

    if persisted > version {
      return Err(StoreError::VersionConflict {
        name: name.to_string(),
        persisted,
        requested: version,
      });
    }

    if version > persisted {
      info!(store = name, from = persisted, to = version, "migrating keyed store");
      on_upgrade(&conn, persisted, version).map_err(map_sqlite_err)?;
      conn
        .execute(
          "INSERT OR REPLACE INTO store_meta (id, version) VALUES (1, ?)",
          params![version],
        )
        .map_err(map_sqlite_err)?;
    }

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Default database path for a named store.
  fn default_path(name: &str) -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::Backend("could not determine data directory".to_string()))?;

    Ok(data_dir.join("tidecache").join(format!("{}.db", name)))
  }

  /// Path of the store's database file for a given name, without opening it.
  pub fn database_path(name: &str) -> Result<PathBuf, StoreError> {
    Self::default_path(name)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Backend(format!("lock poisoned: {}", e)))
  }
}

impl KeyedStore for SqliteStore {
  fn ensure_partition(&self, partition: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(map_sqlite_err)?;
    Ok(())
  }

  fn put(&self, partition: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(map_sqlite_err)?;
    conn
      .execute(
        "INSERT OR REPLACE INTO keyed_records (partition_name, key, value, stored_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![partition, key, value],
      )
      .map_err(map_sqlite_err)?;
    Ok(())
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<KeyedRecord>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT value, stored_at FROM keyed_records
         WHERE partition_name = ? AND key = ?",
      )
      .map_err(map_sqlite_err)?;

    let row: Option<(Vec<u8>, String)> = stmt
      .query_row(params![partition, key], |row| Ok((row.get(0)?, row.get(1)?)))
      .ok();

    match row {
      Some((value, stored_at)) => Ok(Some(KeyedRecord {
        key: key.to_string(),
        value,
        stored_at: parse_datetime(&stored_at)?,
      })),
      None => Ok(None),
    }
  }

  fn get_all(&self, partition: &str) -> Result<Vec<KeyedRecord>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT key, value, stored_at FROM keyed_records
         WHERE partition_name = ? ORDER BY key",
      )
      .map_err(map_sqlite_err)?;

    let rows: Vec<(String, Vec<u8>, String)> = stmt
      .query_map(params![partition], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .map_err(map_sqlite_err)?
      .filter_map(|r| r.ok())
      .collect();

    let mut records = Vec::with_capacity(rows.len());
    for (key, value, stored_at) in rows {
      records.push(KeyedRecord {
        key,
        value,
        stored_at: parse_datetime(&stored_at)?,
      });
    }
    Ok(records)
  }

  fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM keyed_records WHERE partition_name = ? AND key = ?",
        params![partition, key],
      )
      .map_err(map_sqlite_err)?;
    Ok(())
  }

  fn clear(&self, partition: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM keyed_records WHERE partition_name = ?",
        params![partition],
      )
      .map_err(map_sqlite_err)?;
    Ok(())
  }

  fn partitions(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(map_sqlite_err)?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(map_sqlite_err)?
      .filter_map(|r| r.ok())
      .collect();
    Ok(names)
  }

  fn drop_partition(&self, partition: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM keyed_records WHERE partition_name = ?",
        params![partition],
      )
      .map_err(map_sqlite_err)?;
    conn
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(map_sqlite_err)?;
    Ok(())
  }
}

fn map_sqlite_err(e: rusqlite::Error) -> StoreError {
  if let rusqlite::Error::SqliteFailure(err, _) = &e {
    match err.code {
      rusqlite::ErrorCode::DiskFull => return StoreError::Quota,
      rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
        return StoreError::Blocked
      }
      _ => {}
    }
  }
  StoreError::Backend(e.to_string())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StoreError::Backend(format!("failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::StoreError;

  fn store() -> SqliteStore {
    SqliteStore::open_in_memory(1, |_, _, _| Ok(())).unwrap()
  }

  #[test]
  fn test_put_get_roundtrip() {
    let store = store();
    store.put("outbox", "a", b"payload").unwrap();

    let record = store.get("outbox", "a").unwrap().unwrap();
    assert_eq!(record.value, b"payload");
    assert_eq!(record.key, "a");
  }

  #[test]
  fn test_get_missing_key_is_none() {
    let store = store();
    assert!(store.get("outbox", "missing").unwrap().is_none());
  }

  #[test]
  fn test_last_write_wins() {
    let store = store();
    store.put("p", "k", b"first").unwrap();
    store.put("p", "k", b"second").unwrap();

    assert_eq!(store.get("p", "k").unwrap().unwrap().value, b"second");
    assert_eq!(store.get_all("p").unwrap().len(), 1);
  }

  #[test]
  fn test_ensure_partition_makes_empty_partition_visible() {
    let store = store();
    store.ensure_partition("tc-html-v1.0.0").unwrap();
    assert_eq!(store.partitions().unwrap(), vec!["tc-html-v1.0.0"]);
  }

  #[test]
  fn test_drop_partition_removes_records_and_listing() {
    let store = store();
    store.put("old", "k", b"v").unwrap();
    store.put("new", "k", b"v").unwrap();

    store.drop_partition("old").unwrap();

    assert_eq!(store.partitions().unwrap(), vec!["new"]);
    assert!(store.get("old", "k").unwrap().is_none());
  }

  #[test]
  fn test_clear_keeps_partition() {
    let store = store();
    store.put("p", "k", b"v").unwrap();
    store.clear("p").unwrap();

    assert!(store.get_all("p").unwrap().is_empty());
    assert_eq!(store.partitions().unwrap(), vec!["p"]);
  }

  #[test]
  fn test_upgrade_callback_runs_once_with_old_version() {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch(
        "CREATE TABLE store_meta (id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL);
         INSERT INTO store_meta (id, version) VALUES (1, 1);",
      )
      .unwrap();

    let mut seen = None;
    let store = SqliteStore::from_connection("test", conn, 3, |_, old, new| {
      seen = Some((old, new));
      Ok(())
    })
    .unwrap();
    drop(store);

    assert_eq!(seen, Some((1, 3)));
  }

  #[test]
  fn test_open_below_persisted_version_fails() {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch(
        "CREATE TABLE store_meta (id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL);
         INSERT INTO store_meta (id, version) VALUES (1, 5);",
      )
      .unwrap();

    let result = SqliteStore::from_connection("test", conn, 2, |_, _, _| Ok(()));
    assert!(matches!(
      result,
      Err(StoreError::VersionConflict {
        persisted: 5,
        requested: 2,
        ..
      })
    ));
  }
}
