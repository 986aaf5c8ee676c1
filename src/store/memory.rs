//! In-memory keyed store.
//!
//! Same contract as the SQLite backend without persistence. Used by tests
//! and by hosts that want a warm cache with no disk footprint.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{KeyedRecord, KeyedStore};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryStore {
  partitions: Mutex<HashMap<String, BTreeMap<String, KeyedRecord>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(
    &self,
  ) -> Result<std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, KeyedRecord>>>, StoreError>
  {
    self
      .partitions
      .lock()
      .map_err(|e| StoreError::Backend(format!("lock poisoned: {}", e)))
  }
}

impl KeyedStore for MemoryStore {
  fn ensure_partition(&self, partition: &str) -> Result<(), StoreError> {
    self.lock()?.entry(partition.to_string()).or_default();
    Ok(())
  }

  fn put(&self, partition: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
    self.lock()?.entry(partition.to_string()).or_default().insert(
      key.to_string(),
      KeyedRecord {
        key: key.to_string(),
        value: value.to_vec(),
        stored_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<KeyedRecord>, StoreError> {
    Ok(
      self
        .lock()?
        .get(partition)
        .and_then(|records| records.get(key))
        .cloned(),
    )
  }

  fn get_all(&self, partition: &str) -> Result<Vec<KeyedRecord>, StoreError> {
    Ok(
      self
        .lock()?
        .get(partition)
        .map(|records| records.values().cloned().collect())
        .unwrap_or_default(),
    )
  }

  fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError> {
    if let Some(records) = self.lock()?.get_mut(partition) {
      records.remove(key);
    }
    Ok(())
  }

  fn clear(&self, partition: &str) -> Result<(), StoreError> {
    if let Some(records) = self.lock()?.get_mut(partition) {
      records.clear();
    }
    Ok(())
  }

  fn partitions(&self) -> Result<Vec<String>, StoreError> {
    let mut names: Vec<String> = self.lock()?.keys().cloned().collect();
    names.sort();
    Ok(names)
  }

  fn drop_partition(&self, partition: &str) -> Result<(), StoreError> {
    self.lock()?.remove(partition);
    Ok(())
  }
}
