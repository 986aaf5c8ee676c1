//! Caching strategies.
//!
//! Each strategy is implemented exactly once, parameterized by namespace
//! and timeout. All of them resolve to `Some(response)` or `None` when both
//! network and cache are exhausted; the router turns `None` into the
//! class-appropriate synthesized fallback. Responses are tagged with
//! `x-cache-*` headers so callers can observe where bytes came from.
//!
//! Within one invocation the order is fixed: lookup happens before the
//! network attempt, which happens before the cache write. Nothing is
//! guaranteed between concurrent invocations.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::events::{Broadcaster, ClientMessage};
use crate::http::{Request, Response};
use crate::net::Fetch;
use crate::registry::CacheRegistry;

/// The three strategies over one registry and one fetcher.
///
/// Background revalidation work is spawned on the task tracker, which the
/// engine owns and drains on shutdown - the moral equivalent of
/// `event.waitUntil`. Dropping it silently would let the host kill the
/// write mid-flight.
#[derive(Clone)]
pub struct StrategySet {
  registry: Arc<CacheRegistry>,
  fetcher: Arc<dyn Fetch>,
  broadcast: Broadcaster,
  tracker: TaskTracker,
}

impl StrategySet {
  pub fn new(
    registry: Arc<CacheRegistry>,
    fetcher: Arc<dyn Fetch>,
    broadcast: Broadcaster,
    tracker: TaskTracker,
  ) -> Self {
    Self {
      registry,
      fetcher,
      broadcast,
      tracker,
    }
  }

  /// Cache first: serve a hit immediately; on miss fetch, cache ok
  /// responses, and serve the network result. A network failure falls back
  /// to the cache one last time before giving up.
  pub async fn cache_first(&self, request: &Request, namespaces: &[&str]) -> Option<Response> {
    if let Some(hit) = self.lookup(namespaces, request) {
      return Some(tag(hit, "cache-first", "HIT", "cache"));
    }

    debug!(url = %request.url, "cache miss, fetching from network");
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.write(namespaces[0], request, &response);
        }
        Some(tag(response, "cache-first", "MISS", "network"))
      }
      Err(e) => {
        debug!(url = %request.url, "network failed: {}", e);
        self
          .lookup(namespaces, request)
          .map(|hit| tag(hit, "cache-first", "HIT", "cache"))
      }
    }
  }

  /// Network first: race the fetch against a timeout. An ok response is
  /// cached and served; timeout, network error, or a non-ok status all fall
  /// back to the cache, tagged stale.
  pub async fn network_first(
    &self,
    request: &Request,
    namespaces: &[&str],
    network_timeout: Duration,
  ) -> Option<Response> {
    // The fetch future is dropped on timeout, which aborts the request.
    let outcome = timeout(network_timeout, self.fetcher.fetch(request)).await;

    match outcome {
      Ok(Ok(response)) if response.ok() => {
        self.write(namespaces[0], request, &response);
        Some(tag(response, "network-first", "REFRESH", "network"))
      }
      Ok(Ok(response)) => {
        debug!(url = %request.url, status = response.status, "non-ok network response, trying cache");
        self.stale_fallback(namespaces, request)
      }
      Ok(Err(e)) => {
        debug!(url = %request.url, "network failed, trying cache: {}", e);
        self.stale_fallback(namespaces, request)
      }
      Err(_) => {
        debug!(url = %request.url, timeout_ms = network_timeout.as_millis() as u64, "network timed out, trying cache");
        self.stale_fallback(namespaces, request)
      }
    }
  }

  /// Stale while revalidate: serve a hit immediately and refresh the cache
  /// in the background for future requests. Without a hit, await the fetch
  /// inline. The current request never sees the revalidated bytes.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    namespaces: &[&str],
  ) -> Option<Response> {
    let cached = self.lookup(namespaces, request);

    if let Some(hit) = cached {
      self.spawn_revalidation(request.clone(), namespaces[0].to_string());
      return Some(tag(hit, "stale-while-revalidate", "STALE", "cache"));
    }

    debug!(url = %request.url, "no cached copy, waiting for network");
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.write(namespaces[0], request, &response);
        }
        Some(tag(response, "stale-while-revalidate", "MISS", "network"))
      }
      Err(e) => {
        debug!(url = %request.url, "network failed with empty cache: {}", e);
        None
      }
    }
  }

  fn spawn_revalidation(&self, request: Request, namespace: String) {
    let fetcher = Arc::clone(&self.fetcher);
    let registry = Arc::clone(&self.registry);
    let broadcast = self.broadcast.clone();

    self.tracker.spawn(async move {
      match fetcher.fetch(&request).await {
        Ok(response) if response.ok() => {
          if let Err(e) = registry.put(&namespace, &request, &response) {
            warn!(url = %request.url, "revalidation cache write failed: {}", e);
            return;
          }
          debug!(url = %request.url, "background cache update completed");
          broadcast.send(ClientMessage::CacheUpdated {
            url: request.url.to_string(),
          });
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "revalidation skipped non-ok response");
        }
        Err(e) => {
          debug!(url = %request.url, "background fetch failed: {}", e);
        }
      }
    });
  }

  /// Cache lookup that treats storage failures as misses.
  fn lookup(&self, namespaces: &[&str], request: &Request) -> Option<Response> {
    match self.registry.match_first(namespaces, request) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %request.url, "cache lookup failed: {}", e);
        None
      }
    }
  }

  /// Cache write whose failure never fails the request path.
  fn write(&self, namespace: &str, request: &Request, response: &Response) {
    if let Err(e) = self.registry.put(namespace, request, response) {
      warn!(url = %request.url, "cache write failed: {}", e);
    }
  }

  fn stale_fallback(&self, namespaces: &[&str], request: &Request) -> Option<Response> {
    self
      .lookup(namespaces, request)
      .map(|hit| tag(hit, "network-first", "STALE", "cache"))
  }
}

/// Observability headers on every strategy response.
fn tag(mut response: Response, strategy: &str, status: &str, served_from: &str) -> Response {
  response.set_header("x-cache-strategy", strategy);
  response.set_header("x-cache-status", status);
  response.set_header("x-served-from", served_from);
  response
}
