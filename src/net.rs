//! Network access behind a trait seam.
//!
//! Strategies and controllers depend on [`Fetch`] so tests can script the
//! network; [`HttpFetcher`] is the real implementation over reqwest.

use async_trait::async_trait;
use tracing::debug;

use crate::error::FetchError;
use crate::http::{Method, Request, Response};

/// Performs a network fetch for an intercepted request.
#[async_trait]
pub trait Fetch: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// reqwest-backed fetcher.
#[derive(Clone, Default)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
    }
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Delete => reqwest::Method::DELETE,
    Method::Patch => reqwest::Method::PATCH,
  }
}

#[async_trait]
impl Fetch for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    debug!(method = request.method.as_str(), url = %request.url, "network fetch");

    let mut builder = self
      .client
      .request(to_reqwest_method(request.method), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        FetchError::Timeout
      } else {
        FetchError::Network(e.to_string())
      }
    })?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
pub(crate) mod testing {
  //! Scripted fetcher shared by the strategy, lifecycle, outbox and engine
  //! tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::Mutex;
  use std::time::Duration;

  pub struct StubFetcher {
    routes: Mutex<HashMap<String, Result<Response, FetchError>>>,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
  }

  impl StubFetcher {
    pub fn new() -> Self {
      Self {
        routes: Mutex::new(HashMap::new()),
        calls: Mutex::new(Vec::new()),
        delay: Mutex::new(None),
      }
    }

    /// Serve `response` for every fetch of `url`.
    pub fn respond(&self, url: &str, response: Response) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), Ok(response));
    }

    /// Fail every fetch of `url` with a network error.
    pub fn fail(&self, url: &str) {
      self.routes.lock().unwrap().insert(
        url.to_string(),
        Err(FetchError::Network("connection refused".to_string())),
      );
    }

    /// Delay every fetch, to exercise timeout paths.
    pub fn set_delay(&self, delay: Duration) {
      *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, url: &str) -> usize {
      self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
    }
  }

  #[async_trait]
  impl Fetch for StubFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
      self.calls.lock().unwrap().push(request.url.to_string());

      let delay = *self.delay.lock().unwrap();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }

      let routes = self.routes.lock().unwrap();
      match routes.get(request.url.as_str()) {
        Some(result) => result.clone(),
        None => Err(FetchError::Network(format!(
          "no stub for {}",
          request.url
        ))),
      }
    }
  }
}
