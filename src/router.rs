//! Request classification and dispatch.
//!
//! Every intercepted request is classified into exactly one category by
//! ordered predicates, then routed through the fixed binding table below.
//! The table is data, not per-request logic, so the bindings are testable
//! on their own.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{CacheRole, EngineConfig};
use crate::http::{Destination, FetchMode, Method, Request, Response};
use crate::registry::CacheRegistry;
use crate::strategy::StrategySet;

/// Request category, assigned by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Html,
  Static,
  Image,
  Api,
  Misc,
}

/// Strategy selector used by the binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
  CacheFirst,
  /// Network first with the default timeout.
  NetworkFirst,
  /// Network first with the shorter API timeout.
  NetworkFirstShort,
  StaleWhileRevalidate,
}

/// One row of the routing table.
#[derive(Debug, Clone, Copy)]
pub struct RouteBinding {
  pub class: RequestClass,
  pub strategy: StrategyKind,
  pub role: CacheRole,
}

/// The complete, fixed binding of categories to strategies and namespaces.
pub const ROUTES: [RouteBinding; 5] = [
  RouteBinding {
    class: RequestClass::Html,
    strategy: StrategyKind::NetworkFirst,
    role: CacheRole::Html,
  },
  RouteBinding {
    class: RequestClass::Static,
    strategy: StrategyKind::CacheFirst,
    role: CacheRole::Static,
  },
  RouteBinding {
    class: RequestClass::Image,
    strategy: StrategyKind::StaleWhileRevalidate,
    role: CacheRole::Image,
  },
  RouteBinding {
    class: RequestClass::Api,
    strategy: StrategyKind::NetworkFirstShort,
    role: CacheRole::Api,
  },
  RouteBinding {
    class: RequestClass::Misc,
    strategy: StrategyKind::StaleWhileRevalidate,
    role: CacheRole::Misc,
  },
];

pub fn binding_for(class: RequestClass) -> RouteBinding {
  // The table covers every class, so this always finds a row.
  ROUTES
    .iter()
    .copied()
    .find(|binding| binding.class == class)
    .unwrap_or(ROUTES[4])
}

/// Classify a request, or `None` for requests the engine must not touch.
///
/// Predicate order matters: non-GET and cross-origin requests pass through
/// untouched before any category is considered.
pub fn classify(request: &Request, config: &EngineConfig) -> Option<RequestClass> {
  if request.method != Method::Get {
    return None;
  }
  if request.url.origin() != config.origin.origin() {
    return None;
  }

  if request.mode == FetchMode::Navigate || request.destination == Destination::Document {
    return Some(RequestClass::Html);
  }

  match request.destination {
    Destination::Style | Destination::Script | Destination::Font => {
      return Some(RequestClass::Static)
    }
    Destination::Image => return Some(RequestClass::Image),
    _ => {}
  }

  if is_api_path(request.url.path(), &config.api_root) {
    return Some(RequestClass::Api);
  }

  Some(RequestClass::Misc)
}

/// The API root matches on a path-segment boundary: `/api` covers `/api`
/// and `/api/deals` but not `/api-docs` or `/apiculture`.
fn is_api_path(path: &str, api_root: &str) -> bool {
  let root = api_root.trim_end_matches('/');
  match path.strip_prefix(root) {
    Some(rest) => rest.is_empty() || rest.starts_with('/'),
    None => false,
  }
}

/// Dispatches intercepted requests to strategies and synthesizes the
/// class-appropriate fallback when every layer is exhausted.
#[derive(Clone)]
pub struct Router {
  config: Arc<EngineConfig>,
  registry: Arc<CacheRegistry>,
  strategies: StrategySet,
}

impl Router {
  pub fn new(
    config: Arc<EngineConfig>,
    registry: Arc<CacheRegistry>,
    strategies: StrategySet,
  ) -> Self {
    Self {
      config,
      registry,
      strategies,
    }
  }

  /// Handle one intercepted request. `None` means pass through untouched.
  pub async fn dispatch(&self, request: &Request, preload: Option<Response>) -> Option<Response> {
    let class = match classify(request, &self.config) {
      Some(class) => class,
      None => {
        debug!(url = %request.url, "passthrough");
        return None;
      }
    };

    let binding = binding_for(class);
    let namespace = self.config.cache_name(binding.role);
    debug!(url = %request.url, ?class, strategy = ?binding.strategy, %namespace, "routing request");

    // A preloaded navigation response wins outright; cache it like any
    // other network-first success.
    if class == RequestClass::Html {
      if let Some(preloaded) = preload {
        if preloaded.ok() {
          if let Err(e) = self.registry.put(&namespace, request, &preloaded) {
            debug!(url = %request.url, "preload cache write failed: {}", e);
          }
          return Some(preloaded);
        }
      }
    }

    let shell_namespace = self.config.cache_name(CacheRole::Shell);
    let response = match binding.strategy {
      StrategyKind::CacheFirst => {
        self
          .strategies
          .cache_first(request, &[namespace.as_str(), shell_namespace.as_str()])
          .await
      }
      StrategyKind::NetworkFirst => {
        // Navigation lookups also fall back to the precached shell.
        self
          .strategies
          .network_first(
            request,
            &[namespace.as_str(), shell_namespace.as_str()],
            Duration::from_millis(self.config.network_timeout_ms),
          )
          .await
      }
      StrategyKind::NetworkFirstShort => {
        self
          .strategies
          .network_first(
            request,
            &[namespace.as_str()],
            Duration::from_millis(self.config.api_timeout_ms),
          )
          .await
      }
      StrategyKind::StaleWhileRevalidate => {
        self
          .strategies
          .stale_while_revalidate(request, &[namespace.as_str()])
          .await
      }
    };

    Some(response.unwrap_or_else(|| self.fallback_for(class)))
  }

  /// Synthesized response when both network and cache are exhausted. The
  /// end user never sees a raw connection error from this layer.
  fn fallback_for(&self, class: RequestClass) -> Response {
    match class {
      RequestClass::Html => self.offline_document(),
      RequestClass::Image => Response::image_placeholder(),
      RequestClass::Api => Response::offline_api(),
      RequestClass::Static | RequestClass::Misc => Response::unavailable(),
    }
  }

  /// Prefer the precached offline page from the shell; synthesize a
  /// minimal document only as a last resort.
  fn offline_document(&self) -> Response {
    let shell_namespace = self.config.cache_name(CacheRole::Shell);
    if let Ok(offline_url) = self.config.absolute_url(&self.config.offline_url) {
      let offline_request = Request::get(offline_url);
      if let Ok(Some(page)) = self
        .registry
        .match_first(&[shell_namespace.as_str()], &offline_request)
      {
        return page;
      }
    }
    Response::offline_page(&self.config.app_name)
  }
}
