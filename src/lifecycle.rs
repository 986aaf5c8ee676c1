//! Install/activate lifecycle.
//!
//! A new engine version installs by precaching the shell manifest into the
//! new version's namespaces, then waits until activation. Activation
//! garbage-collects every namespace of older versions and claims the
//! clients. The old generation keeps serving untouched until then.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{CacheRole, EngineConfig};
use crate::events::{Broadcaster, ClientMessage};
use crate::http::Request;
use crate::net::Fetch;
use crate::registry::CacheRegistry;

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  Waiting,
  Activating,
  Activated,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      LifecycleState::Installing => "installing",
      LifecycleState::Waiting => "waiting",
      LifecycleState::Activating => "activating",
      LifecycleState::Activated => "activated",
    }
  }
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

pub struct LifecycleController {
  config: Arc<EngineConfig>,
  registry: Arc<CacheRegistry>,
  fetcher: Arc<dyn Fetch>,
  broadcast: Broadcaster,
  state: Mutex<LifecycleState>,
  preload_enabled: AtomicBool,
}

impl LifecycleController {
  pub fn new(
    config: Arc<EngineConfig>,
    registry: Arc<CacheRegistry>,
    fetcher: Arc<dyn Fetch>,
    broadcast: Broadcaster,
  ) -> Self {
    Self {
      config,
      registry,
      fetcher,
      broadcast,
      state: Mutex::new(LifecycleState::Installing),
      preload_enabled: AtomicBool::new(false),
    }
  }

  pub fn state(&self) -> LifecycleState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  fn set_state(&self, next: LifecycleState) {
    match self.state.lock() {
      Ok(mut state) => *state = next,
      Err(poisoned) => *poisoned.into_inner() = next,
    }
    debug!(state = %next, "lifecycle transition");
  }

  /// Whether activation enabled the host's navigation preload.
  pub fn preload_enabled(&self) -> bool {
    self.preload_enabled.load(Ordering::Relaxed)
  }

  /// Precache the shell manifest into the new version's namespaces.
  ///
  /// All-or-nothing: any entry that fails to fetch fails the install, and
  /// the engine never activates with a partial shell. Entries with a
  /// revision fetch the revision-busted URL but are stored under the plain
  /// URL, so lookups at serve time need no revision knowledge.
  pub async fn install(&self) -> Result<()> {
    info!(version = %self.config.version, entries = self.config.shell.len(), "installing");
    self.set_state(LifecycleState::Installing);

    for name in self.config.current_cache_names() {
      self
        .registry
        .open_namespace(&name)
        .map_err(|e| eyre!("failed to open cache namespace {}: {}", name, e))?;
    }

    // Fetch every entry concurrently; nothing is written until all of them
    // succeed, so a failed install leaves no partial shell behind.
    let fetches = self.config.shell.iter().map(|entry| {
      let fetcher = Arc::clone(&self.fetcher);
      let config = Arc::clone(&self.config);
      async move {
        let fetch_url = config.absolute_url(&entry.precache_url())?;
        let store_url = config.absolute_url(&entry.url)?;

        let response = fetcher
          .fetch(&Request::get(fetch_url.clone()))
          .await
          .map_err(|e| eyre!("precache fetch failed for {}: {}", fetch_url, e))?;
        if !response.ok() {
          return Err(eyre!(
            "precache fetch for {} returned {} {}",
            fetch_url,
            response.status,
            response.status_text
          ));
        }
        Ok((entry, store_url, response))
      }
    });
    let fetched = try_join_all(fetches).await?;

    let shell_namespace = self.config.cache_name(CacheRole::Shell);
    for (entry, store_url, response) in fetched {
      self
        .registry
        .put(&shell_namespace, &Request::get(store_url), &response)
        .map_err(|e| eyre!("precache write failed for {}: {}", entry.url, e))?;
      debug!(url = %entry.url, "precached shell entry");
    }

    self.set_state(LifecycleState::Waiting);
    info!(version = %self.config.version, "installed, waiting for activation");
    self.broadcast.send(ClientMessage::UpdateAvailable {
      version: self.config.version.clone(),
    });
    Ok(())
  }

  /// Promote a waiting installation so the next activate call proceeds.
  /// Returns false when there is nothing waiting.
  pub fn skip_waiting(&self) -> bool {
    if self.state() == LifecycleState::Waiting {
      info!("skip waiting requested");
      true
    } else {
      debug!(state = %self.state(), "skip waiting ignored");
      false
    }
  }

  /// Take over: garbage-collect older generations, enable navigation
  /// preload if configured, and claim every client.
  pub async fn activate(&self) -> Result<()> {
    info!(version = %self.config.version, "activating");
    self.set_state(LifecycleState::Activating);

    let keep = self.config.current_cache_names().into_iter().collect();
    let deleted = self
      .registry
      .delete_prefixed_except(&self.config.owned_prefix(), &keep)
      .map_err(|e| eyre!("cache garbage collection failed: {}", e))?;
    if deleted > 0 {
      info!(deleted, "garbage-collected stale cache namespaces");
    }

    self
      .preload_enabled
      .store(self.config.navigation_preload, Ordering::Relaxed);
    if self.config.navigation_preload {
      debug!("navigation preload enabled");
    }

    self.set_state(LifecycleState::Activated);
    self.broadcast.send(ClientMessage::ClientsClaimed {
      version: self.config.version.clone(),
    });
    self.broadcast.send(ClientMessage::Activated {
      version: self.config.version.clone(),
    });
    info!(version = %self.config.version, "activated");
    Ok(())
  }

  /// Delete every namespace this engine owns, current generation included.
  /// The next install starts from nothing.
  pub fn clear_all_caches(&self) -> Result<usize> {
    let names = self
      .registry
      .list_namespaces(&self.config.owned_prefix())
      .map_err(|e| eyre!("failed to list cache namespaces: {}", e))?;

    let count = names.len();
    for name in &names {
      if let Err(e) = self.registry.delete_namespace(name) {
        warn!(namespace = %name, "failed to delete namespace: {}", e);
      }
    }

    info!(count, "cleared all caches");
    self.broadcast.send(ClientMessage::CachesCleared { count });
    Ok(count)
  }
}
