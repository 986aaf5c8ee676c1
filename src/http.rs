//! Request/response model for the interception layer.
//!
//! Requests carry the classification inputs the router needs (method, URL,
//! mode, destination); responses are plain serializable values so the cache
//! registry can persist them byte-for-byte. Synthesized offline responses
//! live here too, so no caller ever sees a raw connection error.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// HTTP methods the engine deals with. Only GET responses are ever cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
  Patch,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
      Method::Patch => "PATCH",
    }
  }
}

/// How the request was initiated, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchMode {
  /// A top-level document navigation.
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// What kind of resource the request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Style,
  Script,
  Font,
  Image,
  #[default]
  Other,
}

/// An intercepted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  #[serde(default)]
  pub headers: Vec<(String, String)>,
  #[serde(default)]
  pub body: Option<Vec<u8>>,
  #[serde(default)]
  pub mode: FetchMode,
  #[serde(default)]
  pub destination: Destination,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      mode: FetchMode::default(),
      destination: Destination::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// A top-level navigation request for a document.
  pub fn navigate(url: Url) -> Self {
    let mut request = Self::get(url);
    request.mode = FetchMode::Navigate;
    request.destination = Destination::Document;
    request
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_json_body(mut self, value: &serde_json::Value) -> Self {
    self.body = Some(value.to_string().into_bytes());
    self
      .headers
      .push(("content-type".to_string(), "application/json".to_string()));
    self
  }

  /// Case-insensitive header lookup, first match wins.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether this request may be served from or written to a cache at all.
  pub fn is_cacheable(&self) -> bool {
    if self.method != Method::Get {
      return false;
    }
    if let Some(cc) = self.header("cache-control") {
      if cc.contains("no-cache") {
        return false;
      }
    }
    true
  }
}

/// A response as stored and served by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, status_text: &str) -> Self {
    Self {
      status,
      status_text: status_text.to_string(),
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.set_header(name, value);
    self
  }

  /// Case-insensitive header lookup, first match wins.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Set a header, replacing any existing value under the same name.
  pub fn set_header(&mut self, name: &str, value: &str) {
    if let Some(slot) = self
      .headers
      .iter_mut()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
    {
      slot.1 = value.to_string();
    } else {
      self.headers.push((name.to_string(), value.to_string()));
    }
  }

  pub fn json(status: u16, status_text: &str, value: &serde_json::Value) -> Self {
    Self::new(status, status_text)
      .with_header("content-type", "application/json")
      .with_body(value.to_string().into_bytes())
  }

  /// Generic 503 for exhausted fallback chains on misc resources.
  pub fn unavailable() -> Self {
    Self::new(503, "Service Unavailable")
      .with_header("content-type", "text/plain")
      .with_body(b"Network error and no cache".to_vec())
  }

  /// 503 JSON body for API requests with nothing cached.
  pub fn offline_api() -> Self {
    Self::json(
      503,
      "Service Unavailable",
      &serde_json::json!({
        "error": "offline",
        "message": "Network unavailable and no cached copy exists",
      }),
    )
  }

  /// Minimal offline document for navigation requests.
  pub fn offline_page(app_name: &str) -> Self {
    let html = format!(
      "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n\
       <meta charset=\"UTF-8\">\n\
       <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
       <title>{app_name} - Offline</title>\n</head>\n<body>\n\
       <h1>You're Offline</h1>\n\
       <p>Check your connection and try again.</p>\n\
       <a href=\"/\">Retry</a>\n</body>\n</html>\n"
    );
    Self::new(503, "Service Unavailable")
      .with_header("content-type", "text/html; charset=utf-8")
      .with_body(html.into_bytes())
  }

  /// Tiny inline SVG served when an image cannot be fetched or found.
  pub fn image_placeholder() -> Self {
    let svg = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"64\" height=\"64\">\
               <rect width=\"64\" height=\"64\" fill=\"#e5e7eb\"/>\
               <text x=\"32\" y=\"36\" text-anchor=\"middle\" font-size=\"10\" fill=\"#6b7280\">offline</text>\
               </svg>";
    Self::new(200, "OK")
      .with_header("content-type", "image/svg+xml")
      .with_body(svg.as_bytes().to_vec())
  }
}

/// Stable lookup key for a cached request.
///
/// The URL is normalized before hashing: fragments never reach the server,
/// and query strings on static assets and images are treated as cache
/// busters rather than distinct resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn of(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);
    if matches!(
      request.destination,
      Destination::Style | Destination::Script | Destination::Font | Destination::Image
    ) {
      url.set_query(None);
    }

    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_str().as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_request_key_is_stable() {
    let a = Request::get(url("https://example.com/app.js"));
    let b = Request::get(url("https://example.com/app.js"));
    assert_eq!(RequestKey::of(&a), RequestKey::of(&b));
  }

  #[test]
  fn test_request_key_strips_fragment() {
    let a = Request::get(url("https://example.com/page#top"));
    let b = Request::get(url("https://example.com/page"));
    assert_eq!(RequestKey::of(&a), RequestKey::of(&b));
  }

  #[test]
  fn test_request_key_strips_query_for_static_assets() {
    let a = Request::get(url("https://example.com/app.css?v=2")).with_destination(Destination::Style);
    let b = Request::get(url("https://example.com/app.css")).with_destination(Destination::Style);
    assert_eq!(RequestKey::of(&a), RequestKey::of(&b));
  }

  #[test]
  fn test_request_key_keeps_query_for_api_requests() {
    let a = Request::get(url("https://example.com/api/deals?page=1"));
    let b = Request::get(url("https://example.com/api/deals?page=2"));
    assert_ne!(RequestKey::of(&a), RequestKey::of(&b));
  }

  #[test]
  fn test_non_get_is_not_cacheable() {
    let request = Request::new(Method::Post, url("https://example.com/api/ideas"));
    assert!(!request.is_cacheable());
  }

  #[test]
  fn test_no_cache_header_is_not_cacheable() {
    let request =
      Request::get(url("https://example.com/a")).with_header("Cache-Control", "no-cache");
    assert!(!request.is_cacheable());
  }

  #[test]
  fn test_offline_api_shape() {
    let response = Response::offline_api();
    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["error"], "offline");
  }

  #[test]
  fn test_set_header_replaces_existing() {
    let mut response = Response::new(200, "OK").with_header("X-Cache-Status", "MISS");
    response.set_header("x-cache-status", "HIT");
    assert_eq!(response.header("X-Cache-Status"), Some("HIT"));
    assert_eq!(
      response
        .headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("x-cache-status"))
        .count(),
      1
    );
  }
}
