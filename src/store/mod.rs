//! Keyed persistence layer.
//!
//! A generic versioned key-value store partitioned into named object
//! stores. It backs both the cache registry (serialized responses) and the
//! outbox (pending writes). Writes to the same key are serialized by the
//! backend; last write wins. A missing key is `Ok(None)`, never an error.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// One stored record.
#[derive(Debug, Clone)]
pub struct KeyedRecord {
  pub key: String,
  pub value: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

/// Storage backend contract.
///
/// Partitions are cheap named buckets; `ensure_partition` makes one visible
/// to enumeration before any record lands in it. Callers must not assume
/// read-then-write atomicity across two calls - each operation is its own
/// atomic unit of work.
pub trait KeyedStore: Send + Sync {
  /// Create the partition if it does not exist yet.
  fn ensure_partition(&self, partition: &str) -> Result<(), StoreError>;

  /// Insert or overwrite the record under `key`.
  fn put(&self, partition: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;

  /// Fetch one record; a missing key resolves to `None`.
  fn get(&self, partition: &str, key: &str) -> Result<Option<KeyedRecord>, StoreError>;

  /// All records in a partition, ordered by key.
  fn get_all(&self, partition: &str) -> Result<Vec<KeyedRecord>, StoreError>;

  /// Remove one record. Removing a missing key is a no-op.
  fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError>;

  /// Remove every record in a partition, keeping the partition itself.
  fn clear(&self, partition: &str) -> Result<(), StoreError>;

  /// All known partition names, sorted.
  fn partitions(&self) -> Result<Vec<String>, StoreError>;

  /// Remove a partition and everything in it.
  fn drop_partition(&self, partition: &str) -> Result<(), StoreError>;
}
