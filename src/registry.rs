//! Named, versioned content caches.
//!
//! Each namespace is a partition of request→response pairs in the keyed
//! store. Namespaces are bound to a role and a version through their name
//! (`{prefix}-{role}-v{version}`); activation garbage-collects every
//! namespace under the engine's prefix that is not in the current set.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::http::{Request, RequestKey, Response};
use crate::store::KeyedStore;

/// A cached request→response pair as persisted.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
  /// Original request URL, kept so `keys()` can report something readable.
  pub url: String,
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

/// Registry of cache namespaces over a [`KeyedStore`].
#[derive(Clone)]
pub struct CacheRegistry {
  store: Arc<dyn KeyedStore>,
}

impl CacheRegistry {
  pub fn new(store: Arc<dyn KeyedStore>) -> Self {
    Self { store }
  }

  /// Make a namespace exist (and show up in listings) before first write.
  pub fn open_namespace(&self, namespace: &str) -> Result<(), StoreError> {
    self.store.ensure_partition(namespace)
  }

  /// Store a response under the request's key.
  ///
  /// The response is cloned before storing so the caller's copy remains
  /// consumable. Non-GET requests and non-2xx responses are dropped
  /// quietly - callers are expected to check `ok()` first, and a put must
  /// never poison the cache or fail the request path.
  pub fn put(&self, namespace: &str, request: &Request, response: &Response) -> Result<(), StoreError> {
    if !request.is_cacheable() {
      debug!(url = %request.url, "skipping cache put for uncacheable request");
      return Ok(());
    }
    if !response.ok() {
      debug!(url = %request.url, status = response.status, "skipping cache put for non-ok response");
      return Ok(());
    }

    let entry = CacheEntry {
      url: request.url.to_string(),
      response: response.clone(),
      stored_at: Utc::now(),
    };
    let bytes = serde_json::to_vec(&entry)
      .map_err(|e| StoreError::Backend(format!("failed to serialize cache entry: {}", e)))?;

    let key = RequestKey::of(request);
    self.store.put(namespace, key.as_str(), &bytes)
  }

  /// Search the given namespaces in order; first hit wins.
  pub fn match_first(
    &self,
    namespaces: &[&str],
    request: &Request,
  ) -> Result<Option<Response>, StoreError> {
    let key = RequestKey::of(request);

    for namespace in namespaces {
      if let Some(record) = self.store.get(namespace, key.as_str())? {
        match serde_json::from_slice::<CacheEntry>(&record.value) {
          Ok(entry) => {
            debug!(url = %request.url, namespace, "cache hit");
            return Ok(Some(entry.response));
          }
          Err(e) => {
            // Undecodable entries are treated as misses, not failures.
            warn!(namespace, key = key.as_str(), "discarding corrupt cache entry: {}", e);
            self.store.delete(namespace, key.as_str())?;
          }
        }
      }
    }

    debug!(url = %request.url, "cache miss");
    Ok(None)
  }

  /// URLs of every entry in a namespace.
  pub fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
    let records = self.store.get_all(namespace)?;
    Ok(
      records
        .iter()
        .filter_map(|r| serde_json::from_slice::<CacheEntry>(&r.value).ok())
        .map(|entry| entry.url)
        .collect(),
    )
  }

  pub fn entry_count(&self, namespace: &str) -> Result<usize, StoreError> {
    Ok(self.store.get_all(namespace)?.len())
  }

  pub fn delete_namespace(&self, namespace: &str) -> Result<(), StoreError> {
    debug!(namespace, "deleting cache namespace");
    self.store.drop_partition(namespace)
  }

  /// All namespaces under a prefix.
  pub fn list_namespaces(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
    Ok(
      self
        .store
        .partitions()?
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .collect(),
    )
  }

  /// Garbage collection: delete every namespace under `prefix` that is not
  /// in `keep`. Returns how many were deleted. This is the only eviction
  /// path - there is no per-entry TTL.
  pub fn delete_prefixed_except(
    &self,
    prefix: &str,
    keep: &HashSet<String>,
  ) -> Result<usize, StoreError> {
    let stale: Vec<String> = self
      .list_namespaces(prefix)?
      .into_iter()
      .filter(|name| !keep.contains(name))
      .collect();

    for name in &stale {
      self.delete_namespace(name)?;
    }
    Ok(stale.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Method;
  use crate::store::MemoryStore;
  use url::Url;

  fn registry() -> CacheRegistry {
    CacheRegistry::new(Arc::new(MemoryStore::new()))
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  fn ok_response(body: &str) -> Response {
    Response::new(200, "OK").with_body(body.as_bytes().to_vec())
  }

  #[test]
  fn test_put_then_match_roundtrip() {
    let registry = registry();
    let request = get("http://localhost/app.css");

    registry.put("ns", &request, &ok_response("body")).unwrap();

    let hit = registry.match_first(&["ns"], &request).unwrap().unwrap();
    assert_eq!(hit.body, b"body");
  }

  #[test]
  fn test_put_twice_same_key_yields_one_entry() {
    let registry = registry();
    let request = get("http://localhost/app.css");

    registry.put("ns", &request, &ok_response("v1")).unwrap();
    registry.put("ns", &request, &ok_response("v2")).unwrap();

    assert_eq!(registry.entry_count("ns").unwrap(), 1);
    let hit = registry.match_first(&["ns"], &request).unwrap().unwrap();
    assert_eq!(hit.body, b"v2");
  }

  #[test]
  fn test_put_rejects_non_ok_quietly() {
    let registry = registry();
    let request = get("http://localhost/missing");

    registry
      .put("ns", &request, &Response::new(404, "Not Found"))
      .unwrap();

    assert!(registry.match_first(&["ns"], &request).unwrap().is_none());
  }

  #[test]
  fn test_put_rejects_non_get_quietly() {
    let registry = registry();
    let request = Request::new(Method::Post, Url::parse("http://localhost/api/ideas").unwrap());

    registry.put("ns", &request, &ok_response("created")).unwrap();

    assert_eq!(registry.entry_count("ns").unwrap(), 0);
  }

  #[test]
  fn test_match_first_searches_in_order() {
    let registry = registry();
    let request = get("http://localhost/page");

    registry.put("second", &request, &ok_response("fallback")).unwrap();
    registry.put("first", &request, &ok_response("primary")).unwrap();

    let hit = registry
      .match_first(&["first", "second"], &request)
      .unwrap()
      .unwrap();
    assert_eq!(hit.body, b"primary");
  }

  #[test]
  fn test_keys_reports_urls() {
    let registry = registry();
    registry
      .put("ns", &get("http://localhost/a.css"), &ok_response("a"))
      .unwrap();
    registry
      .put("ns", &get("http://localhost/b.css"), &ok_response("b"))
      .unwrap();

    let mut keys = registry.keys("ns").unwrap();
    keys.sort();
    assert_eq!(keys, vec!["http://localhost/a.css", "http://localhost/b.css"]);
  }

  #[test]
  fn test_gc_deletes_stale_keeps_current() {
    let registry = registry();
    registry.open_namespace("tc-static-v1").unwrap();
    registry.open_namespace("tc-static-v2").unwrap();
    registry.open_namespace("tc-html-v2").unwrap();
    registry.open_namespace("other-app").unwrap();

    let keep: HashSet<String> = ["tc-static-v2", "tc-html-v2"]
      .iter()
      .map(|s| s.to_string())
      .collect();
    let deleted = registry.delete_prefixed_except("tc-", &keep).unwrap();

    assert_eq!(deleted, 1);
    let mut remaining = registry.list_namespaces("").unwrap();
    remaining.sort();
    assert_eq!(remaining, vec!["other-app", "tc-html-v2", "tc-static-v2"]);
  }
}
