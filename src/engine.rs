//! The engine: event dispatch over the assembled controllers.
//!
//! One [`ServiceEngine`] owns the registry, router, lifecycle and outbox
//! and turns each [`HostEvent`] into the right calls. Hosts drive it from
//! whatever event loop they have; the engine itself never spawns its own
//! beyond tracked background cache work.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{CacheRole, EngineConfig};
use crate::events::{Broadcaster, ClientMessage, HostEvent, MessageEnvelope};
use crate::http::{Request, Response};
use crate::lifecycle::LifecycleController;
use crate::net::Fetch;
use crate::outbox::{DrainReport, OutboxController};
use crate::registry::CacheRegistry;
use crate::router::Router;
use crate::store::KeyedStore;
use crate::strategy::StrategySet;

/// Partition for payloads refreshed by periodic sync, outside the
/// versioned cache namespaces so a version bump keeps the data.
const PAYLOAD_PARTITION: &str = "payloads";

/// Snapshot answered to a GET_STATUS message.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
  pub app: String,
  pub version: String,
  pub state: String,
  pub namespaces: Vec<String>,
  pub queued_writes: usize,
  pub timestamp: DateTime<Utc>,
}

pub struct ServiceEngine {
  config: Arc<EngineConfig>,
  registry: Arc<CacheRegistry>,
  store: Arc<dyn KeyedStore>,
  fetcher: Arc<dyn Fetch>,
  router: Router,
  lifecycle: LifecycleController,
  outbox: OutboxController,
  broadcast: Broadcaster,
  tracker: TaskTracker,
}

impl ServiceEngine {
  pub fn new(
    config: EngineConfig,
    store: Arc<dyn KeyedStore>,
    fetcher: Arc<dyn Fetch>,
  ) -> Result<Self> {
    let config = Arc::new(config);
    let registry = Arc::new(CacheRegistry::new(Arc::clone(&store)));
    let broadcast = Broadcaster::new(64);
    let tracker = TaskTracker::new();

    let strategies = StrategySet::new(
      Arc::clone(&registry),
      Arc::clone(&fetcher),
      broadcast.clone(),
      tracker.clone(),
    );
    let router = Router::new(Arc::clone(&config), Arc::clone(&registry), strategies);
    let lifecycle = LifecycleController::new(
      Arc::clone(&config),
      Arc::clone(&registry),
      Arc::clone(&fetcher),
      broadcast.clone(),
    );
    let outbox = OutboxController::new(
      Arc::clone(&store),
      Arc::clone(&fetcher),
      Arc::clone(&config),
      broadcast.clone(),
    )
    .map_err(|e| eyre!("failed to open outbox: {}", e))?;

    Ok(Self {
      config,
      registry,
      store,
      fetcher,
      router,
      lifecycle,
      outbox,
      broadcast,
      tracker,
    })
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// Receiver for messages the engine broadcasts to clients.
  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.broadcast.subscribe()
  }

  pub fn preload_enabled(&self) -> bool {
    self.lifecycle.preload_enabled()
  }

  /// Handle one host event. Only fetch events produce a response;
  /// `Ok(None)` for a fetch means the request passes through untouched.
  pub async fn handle_event(&self, event: HostEvent) -> Result<Option<Response>> {
    match event {
      HostEvent::Install => {
        self.lifecycle.install().await?;
        Ok(None)
      }
      HostEvent::Activate => {
        self.lifecycle.activate().await?;
        Ok(None)
      }
      HostEvent::Fetch { request, preload } => Ok(self.router.dispatch(&request, preload).await),
      HostEvent::Message { envelope, reply } => {
        self.handle_message(envelope, reply).await?;
        Ok(None)
      }
      HostEvent::Sync { tag } => {
        if tag == self.config.sync_tag {
          self.drain_outbox().await?;
        } else {
          debug!(tag, "ignoring sync event with unknown tag");
        }
        Ok(None)
      }
      HostEvent::PeriodicSync { tag } => {
        if tag == self.config.periodic_sync_tag {
          self.periodic_refresh().await?;
        } else {
          debug!(tag, "ignoring periodic sync event with unknown tag");
        }
        Ok(None)
      }
    }
  }

  async fn handle_message(
    &self,
    envelope: MessageEnvelope,
    reply: Option<tokio::sync::oneshot::Sender<ClientMessage>>,
  ) -> Result<()> {
    match envelope {
      MessageEnvelope::SkipWaiting => {
        if self.lifecycle.skip_waiting() {
          self.lifecycle.activate().await?;
        }
      }
      MessageEnvelope::ClearCaches => {
        self.lifecycle.clear_all_caches()?;
      }
      MessageEnvelope::GetStatus => {
        let status = self.status()?;
        if let Some(reply) = reply {
          if reply.send(ClientMessage::StatusResponse { status }).is_err() {
            debug!("status reply port closed before send");
          }
        }
      }
      MessageEnvelope::QueueForSync { action, payload } => {
        self
          .outbox
          .enqueue(action, payload)
          .map_err(|e| eyre!("failed to queue write: {}", e))?;
      }
      MessageEnvelope::ForceSync => {
        self.drain_outbox().await?;
      }
    }
    Ok(())
  }

  pub async fn drain_outbox(&self) -> Result<DrainReport> {
    self
      .outbox
      .drain()
      .await
      .map_err(|e| eyre!("outbox drain failed: {}", e))
  }

  /// Refresh the periodic payload: fetch the configured endpoint, cache the
  /// response for API lookups and persist the raw payload for hosts that
  /// read it directly.
  async fn periodic_refresh(&self) -> Result<()> {
    let url = self.config.absolute_url(&self.config.refresh_endpoint)?;
    let request = Request::get(url.clone());
    info!(url = %url, "periodic refresh");

    let response = match self.fetcher.fetch(&request).await {
      Ok(response) if response.ok() => response,
      Ok(response) => {
        warn!(status = response.status, "periodic refresh got non-ok response, keeping cached payload");
        return Ok(());
      }
      Err(e) => {
        warn!("periodic refresh failed, keeping cached payload: {}", e);
        return Ok(());
      }
    };

    let api_namespace = self.config.cache_name(CacheRole::Api);
    self
      .registry
      .put(&api_namespace, &request, &response)
      .map_err(|e| eyre!("failed to cache refreshed payload: {}", e))?;

    self
      .store
      .ensure_partition(PAYLOAD_PARTITION)
      .and_then(|_| {
        self
          .store
          .put(PAYLOAD_PARTITION, &self.config.refresh_endpoint, &response.body)
      })
      .map_err(|e| eyre!("failed to persist refreshed payload: {}", e))?;

    let count = serde_json::from_slice::<serde_json::Value>(&response.body)
      .ok()
      .and_then(|v| v.as_array().map(Vec::len))
      .unwrap_or(0);
    self
      .broadcast
      .send(ClientMessage::PeriodicSyncComplete { count });
    Ok(())
  }

  pub fn status(&self) -> Result<EngineStatus> {
    let namespaces = self
      .registry
      .list_namespaces(&self.config.owned_prefix())
      .map_err(|e| eyre!("failed to list cache namespaces: {}", e))?;
    let queued_writes = self
      .outbox
      .pending_count()
      .map_err(|e| eyre!("failed to count queued writes: {}", e))?;

    Ok(EngineStatus {
      app: self.config.app_name.clone(),
      version: self.config.version.clone(),
      state: self.lifecycle.state().to_string(),
      namespaces,
      queued_writes,
      timestamp: Utc::now(),
    })
  }

  /// Wait for tracked background cache work before the host exits.
  pub async fn shutdown(&self) {
    self.tracker.close();
    self.tracker.wait().await;
    debug!("engine shut down, background work drained");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::manifest::ShellEntry;
  use crate::net::testing::StubFetcher;
  use crate::outbox::WriteAction;
  use crate::store::MemoryStore;
  use tokio::sync::oneshot;
  use url::Url;

  struct Harness {
    engine: ServiceEngine,
    fetcher: Arc<StubFetcher>,
  }

  fn harness(mutate: impl FnOnce(&mut EngineConfig)) -> Harness {
    let mut config = EngineConfig::for_origin(Url::parse("http://localhost:4173").unwrap());
    mutate(&mut config);
    let fetcher = Arc::new(StubFetcher::new());
    let engine = ServiceEngine::new(
      config,
      Arc::new(MemoryStore::new()),
      fetcher.clone() as Arc<dyn Fetch>,
    )
    .unwrap();
    Harness { engine, fetcher }
  }

  fn ok_response(body: &str) -> Response {
    Response::new(200, "OK").with_body(body.as_bytes().to_vec())
  }

  #[tokio::test]
  async fn test_install_then_activate_reaches_activated() {
    let h = harness(|c| c.shell = vec![ShellEntry::new("/index.html")]);
    h.fetcher
      .respond("http://localhost:4173/index.html", ok_response("<html>"));

    h.engine.handle_event(HostEvent::Install).await.unwrap();
    h.engine.handle_event(HostEvent::Activate).await.unwrap();

    assert_eq!(h.engine.status().unwrap().state, "activated");
  }

  #[tokio::test]
  async fn test_fetch_event_routes_same_origin_requests() {
    let h = harness(|_| {});
    h.fetcher
      .respond("http://localhost:4173/api/deals", ok_response("[1,2,3]"));

    let response = h
      .engine
      .handle_event(HostEvent::Fetch {
        request: Request::get(Url::parse("http://localhost:4173/api/deals").unwrap()),
        preload: None,
      })
      .await
      .unwrap();

    assert_eq!(response.unwrap().body, b"[1,2,3]");
  }

  #[tokio::test]
  async fn test_cross_origin_fetch_passes_through() {
    let h = harness(|_| {});

    let response = h
      .engine
      .handle_event(HostEvent::Fetch {
        request: Request::get(Url::parse("https://elsewhere.example.com/x").unwrap()),
        preload: None,
      })
      .await
      .unwrap();

    assert!(response.is_none());
  }

  #[tokio::test]
  async fn test_get_status_answers_on_reply_port() {
    let h = harness(|_| {});
    let (tx, rx) = oneshot::channel();

    h.engine
      .handle_event(HostEvent::Message {
        envelope: MessageEnvelope::GetStatus,
        reply: Some(tx),
      })
      .await
      .unwrap();

    match rx.await.unwrap() {
      ClientMessage::StatusResponse { status } => {
        assert_eq!(status.app, "Tidecache");
        assert_eq!(status.version, "1.0.0");
        assert_eq!(status.queued_writes, 0);
      }
      other => panic!("unexpected reply: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates_a_waiting_install() {
    let h = harness(|_| {});
    h.engine.handle_event(HostEvent::Install).await.unwrap();
    assert_eq!(h.engine.status().unwrap().state, "waiting");

    h.engine
      .handle_event(HostEvent::Message {
        envelope: MessageEnvelope::SkipWaiting,
        reply: None,
      })
      .await
      .unwrap();

    assert_eq!(h.engine.status().unwrap().state, "activated");
  }

  #[tokio::test]
  async fn test_sync_event_with_matching_tag_drains_outbox() {
    let h = harness(|_| {});
    h.fetcher
      .respond("http://localhost:4173/api/ideas", Response::new(201, "Created"));

    h.engine
      .handle_event(HostEvent::Message {
        envelope: MessageEnvelope::QueueForSync {
          action: WriteAction::Create,
          payload: serde_json::json!({ "text": "hike the coast" }),
        },
        reply: None,
      })
      .await
      .unwrap();
    assert_eq!(h.engine.status().unwrap().queued_writes, 1);

    h.engine
      .handle_event(HostEvent::Sync {
        tag: "outbox-sync".to_string(),
      })
      .await
      .unwrap();

    assert_eq!(h.engine.status().unwrap().queued_writes, 0);
    assert_eq!(h.fetcher.calls_for("http://localhost:4173/api/ideas"), 1);
  }

  #[tokio::test]
  async fn test_sync_event_with_unknown_tag_is_ignored() {
    let h = harness(|_| {});
    h.engine
      .handle_event(HostEvent::Message {
        envelope: MessageEnvelope::QueueForSync {
          action: WriteAction::Create,
          payload: serde_json::json!({ "text": "a" }),
        },
        reply: None,
      })
      .await
      .unwrap();

    h.engine
      .handle_event(HostEvent::Sync {
        tag: "someone-elses-tag".to_string(),
      })
      .await
      .unwrap();

    assert_eq!(h.engine.status().unwrap().queued_writes, 1);
    assert!(h.fetcher.calls().is_empty());
  }

  #[tokio::test]
  async fn test_periodic_sync_refreshes_api_cache() {
    let h = harness(|_| {});
    h.fetcher
      .respond("http://localhost:4173/api/deals", ok_response("[{},{},{}]"));
    let mut rx = h.engine.subscribe();

    h.engine
      .handle_event(HostEvent::PeriodicSync {
        tag: "deals-refresh".to_string(),
      })
      .await
      .unwrap();

    assert!(matches!(
      rx.try_recv().unwrap(),
      ClientMessage::PeriodicSyncComplete { count: 3 }
    ));

    // The refreshed payload serves from cache even with the network down.
    h.fetcher.fail("http://localhost:4173/api/deals");
    let response = h
      .engine
      .handle_event(HostEvent::Fetch {
        request: Request::get(Url::parse("http://localhost:4173/api/deals").unwrap()),
        preload: None,
      })
      .await
      .unwrap()
      .unwrap();
    assert_eq!(response.body, b"[{},{},{}]");
  }

  #[tokio::test]
  async fn test_periodic_sync_network_failure_is_not_fatal() {
    let h = harness(|_| {});
    h.fetcher.fail("http://localhost:4173/api/deals");

    h.engine
      .handle_event(HostEvent::PeriodicSync {
        tag: "deals-refresh".to_string(),
      })
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_clear_caches_message_empties_namespaces() {
    let h = harness(|_| {});
    h.engine.handle_event(HostEvent::Install).await.unwrap();
    assert!(!h.engine.status().unwrap().namespaces.is_empty());

    h.engine
      .handle_event(HostEvent::Message {
        envelope: MessageEnvelope::ClearCaches,
        reply: None,
      })
      .await
      .unwrap();

    assert!(h.engine.status().unwrap().namespaces.is_empty());
  }
}
