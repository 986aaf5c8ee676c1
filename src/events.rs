//! Host events and client messaging.
//!
//! The host adapter translates its platform events into [`HostEvent`] and
//! feeds them to the engine's dispatch; the engine talks back to connected
//! clients through the [`Broadcaster`]. Message envelopes mirror the
//! `{type, data}` wire shape clients post.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::engine::EngineStatus;
use crate::http::{Request, Response};
use crate::outbox::WriteAction;

/// An event delivered by the host environment.
#[derive(Debug)]
pub enum HostEvent {
  Install,
  Activate,
  Fetch {
    request: Request,
    /// Navigation-preload response raced by the host, if enabled.
    preload: Option<Response>,
  },
  Message {
    envelope: MessageEnvelope,
    /// Reply port for request/response style messages such as GET_STATUS.
    reply: Option<oneshot::Sender<ClientMessage>>,
  },
  Sync {
    tag: String,
  },
  PeriodicSync {
    tag: String,
  },
}

/// Typed `{type, data}` envelope posted by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageEnvelope {
  SkipWaiting,
  ClearCaches,
  GetStatus,
  QueueForSync {
    action: WriteAction,
    payload: serde_json::Value,
  },
  ForceSync,
}

/// Messages broadcast to all connected clients (or sent to a reply port).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  UpdateAvailable { version: String },
  Activated { version: String },
  ClientsClaimed { version: String },
  CachesCleared { count: usize },
  CacheUpdated { url: String },
  SyncRequested { tag: String },
  SyncComplete { replayed: usize, dropped: usize },
  PeriodicSyncComplete { count: usize },
  StatusResponse { status: EngineStatus },
}

/// Fan-out channel to every connected client.
///
/// Sending with no subscribers is fine - clients come and go.
#[derive(Clone)]
pub struct Broadcaster {
  tx: broadcast::Sender<ClientMessage>,
}

impl Broadcaster {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.tx.subscribe()
  }

  pub fn send(&self, message: ClientMessage) {
    debug!(?message, "broadcasting to clients");
    let _ = self.tx.send(message);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_envelope_wire_shape() {
    let envelope: MessageEnvelope = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert!(matches!(envelope, MessageEnvelope::SkipWaiting));

    let envelope: MessageEnvelope = serde_json::from_str(
      r#"{"type":"QUEUE_FOR_SYNC","data":{"action":"create","payload":{"text":"visit Lisbon"}}}"#,
    )
    .unwrap();
    match envelope {
      MessageEnvelope::QueueForSync { action, payload } => {
        assert_eq!(action, WriteAction::Create);
        assert_eq!(payload["text"], "visit Lisbon");
      }
      other => panic!("unexpected envelope: {:?}", other),
    }
  }

  #[test]
  fn test_broadcast_reaches_all_subscribers() {
    let hub = Broadcaster::new(8);
    let mut a = hub.subscribe();
    let mut b = hub.subscribe();

    hub.send(ClientMessage::CachesCleared { count: 3 });

    assert!(matches!(a.try_recv().unwrap(), ClientMessage::CachesCleared { count: 3 }));
    assert!(matches!(b.try_recv().unwrap(), ClientMessage::CachesCleared { count: 3 }));
  }

  #[test]
  fn test_send_without_subscribers_is_a_noop() {
    let hub = Broadcaster::new(8);
    hub.send(ClientMessage::SyncRequested {
      tag: "outbox-sync".to_string(),
    });
  }
}
