//! Error types for the caching engine.
//!
//! A cache miss is never an error: lookups resolve to `Ok(None)`. The types
//! here cover the two failure domains the strategies and controllers need to
//! distinguish: the network and the backing store.

use thiserror::Error;

/// Network fetch failures.
///
/// A timeout is treated exactly like a network error by every strategy
/// fallback chain, so both live in one enum.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
  /// The request was rejected, reset, or otherwise never produced a response.
  #[error("network error: {0}")]
  Network(String),

  /// The request was aborted because it exceeded its time budget.
  #[error("network timeout")]
  Timeout,
}

/// Keyed-store failures.
#[derive(Error, Debug)]
pub enum StoreError {
  /// The backing storage is out of space. Surfaced, never retried here.
  #[error("storage quota exceeded")]
  Quota,

  /// The store was opened with a version behind the persisted one.
  #[error("store '{name}' is at version {persisted}, refusing to open at version {requested}")]
  VersionConflict {
    name: String,
    persisted: u32,
    requested: u32,
  },

  /// Another connection is holding the store open. The caller should prompt
  /// for a reload rather than spin.
  #[error("store open blocked by another connection")]
  Blocked,

  /// Anything else the backend reports.
  #[error("storage backend error: {0}")]
  Backend(String),
}
