//! Durable offline outbox.
//!
//! Write intents that cannot reach the network are persisted and replayed
//! in enqueue order on the next sync. Replay is at-least-once: a write is
//! only removed after the server acknowledges it, so an interrupted drain
//! re-sends rather than loses. Each failed attempt bumps a retry count;
//! writes past the cap are dropped so one poisoned payload cannot wedge
//! the queue forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::events::{Broadcaster, ClientMessage};
use crate::http::{Method, Request};
use crate::net::Fetch;
use crate::store::KeyedStore;

const OUTBOX_PARTITION: &str = "outbox";

/// What to do with the payload at replay time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
  Create,
  Update,
  Delete,
}

/// A persisted write intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedWrite {
  pub id: Uuid,
  /// Monotonic position in the queue; replay order is defined by this
  /// alone, never by wall-clock timestamps.
  pub seq: u64,
  pub action: WriteAction,
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Writes acknowledged by the server and removed.
  pub replayed: usize,
  /// Writes that failed and stay queued for the next drain.
  pub retried: usize,
  /// Writes dropped after exhausting the retry cap.
  pub dropped: usize,
}

pub struct OutboxController {
  store: Arc<dyn KeyedStore>,
  fetcher: Arc<dyn Fetch>,
  config: Arc<EngineConfig>,
  broadcast: Broadcaster,
  next_seq: AtomicU64,
}

impl OutboxController {
  pub fn new(
    store: Arc<dyn KeyedStore>,
    fetcher: Arc<dyn Fetch>,
    config: Arc<EngineConfig>,
    broadcast: Broadcaster,
  ) -> Result<Self, StoreError> {
    store.ensure_partition(OUTBOX_PARTITION)?;

    // Resume the sequence past anything already queued.
    let highest = store
      .get_all(OUTBOX_PARTITION)?
      .iter()
      .filter_map(|record| serde_json::from_slice::<QueuedWrite>(&record.value).ok())
      .map(|write| write.seq)
      .max()
      .unwrap_or(0);

    Ok(Self {
      store,
      fetcher,
      config,
      broadcast,
      next_seq: AtomicU64::new(highest + 1),
    })
  }

  /// Persist a write intent and ask the host for a sync.
  pub fn enqueue(
    &self,
    action: WriteAction,
    payload: serde_json::Value,
  ) -> Result<QueuedWrite, StoreError> {
    let write = QueuedWrite {
      id: Uuid::new_v4(),
      seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
      action,
      payload,
      enqueued_at: Utc::now(),
      retry_count: 0,
    };
    self.persist(&write)?;
    info!(id = %write.id, ?action, "queued write for sync");

    self.broadcast.send(ClientMessage::SyncRequested {
      tag: self.config.sync_tag.clone(),
    });
    Ok(write)
  }

  /// Every queued write in enqueue order.
  pub fn pending(&self) -> Result<Vec<QueuedWrite>, StoreError> {
    let mut writes: Vec<QueuedWrite> = self
      .store
      .get_all(OUTBOX_PARTITION)?
      .iter()
      .filter_map(|record| serde_json::from_slice(&record.value).ok())
      .collect();
    writes.sort_by_key(|write| write.seq);
    Ok(writes)
  }

  pub fn pending_count(&self) -> Result<usize, StoreError> {
    Ok(self.pending()?.len())
  }

  /// Replay every queued write in order. Failures to read the queue itself
  /// surface as errors; failures of individual writes are accounted in the
  /// report and retried (or dropped) without aborting the pass.
  pub async fn drain(&self) -> Result<DrainReport, StoreError> {
    let pending = self.pending()?;
    if pending.is_empty() {
      debug!("outbox empty, nothing to drain");
      return Ok(DrainReport::default());
    }

    info!(count = pending.len(), "draining outbox");
    let mut report = DrainReport::default();

    for write in pending {
      match self.replay(&write).await {
        Ok(()) => {
          self.store.delete(OUTBOX_PARTITION, &write.id.to_string())?;
          report.replayed += 1;
          debug!(id = %write.id, "write replayed and removed");
        }
        Err(reason) => {
          let mut write = write;
          write.retry_count += 1;
          if write.retry_count >= self.config.retry_cap {
            self.store.delete(OUTBOX_PARTITION, &write.id.to_string())?;
            report.dropped += 1;
            warn!(
              id = %write.id,
              retries = write.retry_count,
              "dropping write after retry cap: {}",
              reason
            );
          } else {
            self.persist(&write)?;
            report.retried += 1;
            debug!(id = %write.id, retries = write.retry_count, "write failed, will retry: {}", reason);
          }
        }
      }
    }

    info!(
      replayed = report.replayed,
      retried = report.retried,
      dropped = report.dropped,
      "outbox drain complete"
    );
    self.broadcast.send(ClientMessage::SyncComplete {
      replayed: report.replayed,
      dropped: report.dropped,
    });
    Ok(report)
  }

  async fn replay(&self, write: &QueuedWrite) -> Result<(), String> {
    let request = self.request_for(write)?;
    debug!(id = %write.id, url = %request.url, "replaying queued write");

    let response = self
      .fetcher
      .fetch(&request)
      .await
      .map_err(|e| format!("network error: {}", e))?;

    if response.ok() {
      Ok(())
    } else {
      Err(format!(
        "server rejected write: {} {}",
        response.status, response.status_text
      ))
    }
  }

  fn request_for(&self, write: &QueuedWrite) -> Result<Request, String> {
    let endpoint = &self.config.sync_endpoint;
    match write.action {
      WriteAction::Create => {
        let url = self
          .config
          .absolute_url(endpoint)
          .map_err(|e| e.to_string())?;
        Ok(Request::new(Method::Post, url).with_json_body(&write.payload))
      }
      WriteAction::Update => {
        let id = self.payload_id(write)?;
        let url = self
          .config
          .absolute_url(&format!("{}/{}", endpoint, id))
          .map_err(|e| e.to_string())?;
        Ok(Request::new(Method::Put, url).with_json_body(&write.payload))
      }
      WriteAction::Delete => {
        let id = self.payload_id(write)?;
        let url = self
          .config
          .absolute_url(&format!("{}/{}", endpoint, id))
          .map_err(|e| e.to_string())?;
        Ok(Request::new(Method::Delete, url))
      }
    }
  }

  fn payload_id(&self, write: &QueuedWrite) -> Result<String, String> {
    write
      .payload
      .get("id")
      .and_then(|v| {
        v.as_str()
          .map(str::to_string)
          .or_else(|| v.as_u64().map(|n| n.to_string()))
      })
      .ok_or_else(|| format!("payload for {:?} write has no id", write.action))
  }

  fn persist(&self, write: &QueuedWrite) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(write)
      .map_err(|e| StoreError::Backend(format!("failed to serialize queued write: {}", e)))?;
    self
      .store
      .put(OUTBOX_PARTITION, &write.id.to_string(), &bytes)
  }
}
