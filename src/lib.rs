//! Offline-first request caching and background sync engine.
//!
//! The engine sits between a host's request loop and the network. It
//! classifies intercepted requests, serves them through per-class caching
//! strategies backed by versioned cache namespaces, queues writes that
//! cannot reach the server, and replays them when connectivity returns.
//!
//! Hosts embed [`engine::ServiceEngine`], feed it [`events::HostEvent`]s
//! and subscribe to the broadcast channel for client-facing messages.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod lifecycle;
pub mod manifest;
pub mod net;
pub mod outbox;
pub mod registry;
pub mod router;
pub mod store;
pub mod strategy;

pub use config::{CacheRole, EngineConfig};
pub use engine::{EngineStatus, ServiceEngine};
pub use error::{FetchError, StoreError};
pub use events::{Broadcaster, ClientMessage, HostEvent, MessageEnvelope};
pub use http::{Request, Response};
