use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::manifest::ShellEntry;

/// Semantic role of a cache namespace. Each role maps to exactly one
/// current namespace per deployed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheRole {
  Shell,
  Html,
  Static,
  Image,
  Api,
  Misc,
}

impl CacheRole {
  pub const ALL: [CacheRole; 6] = [
    CacheRole::Shell,
    CacheRole::Html,
    CacheRole::Static,
    CacheRole::Image,
    CacheRole::Api,
    CacheRole::Misc,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      CacheRole::Shell => "shell",
      CacheRole::Html => "html",
      CacheRole::Static => "static",
      CacheRole::Image => "image",
      CacheRole::Api => "api",
      CacheRole::Misc => "misc",
    }
  }
}

/// Engine configuration. Passed explicitly into the router, lifecycle and
/// outbox controllers at construction time - there is no ambient state.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
  /// Display name used in synthesized offline pages.
  #[serde(default = "default_app_name")]
  pub app_name: String,

  /// Deployable version. Cache namespace names embed this, so a version
  /// bump never collides with a previous generation.
  #[serde(default = "default_version")]
  pub version: String,

  /// Origin this engine governs; requests elsewhere pass through untouched.
  pub origin: Url,

  /// Pathname prefix that classifies a request as an API call.
  #[serde(default = "default_api_root")]
  pub api_root: String,

  /// Prefix shared by every cache namespace this engine owns. Garbage
  /// collection only ever touches namespaces under this prefix.
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,

  /// Network-first timeout for navigation and misc requests.
  #[serde(default = "default_network_timeout")]
  pub network_timeout_ms: u64,

  /// Shorter network-first timeout for API requests.
  #[serde(default = "default_api_timeout")]
  pub api_timeout_ms: u64,

  /// Replay attempts before a queued write is dropped.
  #[serde(default = "default_retry_cap")]
  pub retry_cap: u32,

  /// Background sync tag that triggers an outbox drain.
  #[serde(default = "default_sync_tag")]
  pub sync_tag: String,

  /// Periodic sync tag that triggers a cached-payload refresh.
  #[serde(default = "default_periodic_sync_tag")]
  pub periodic_sync_tag: String,

  /// Endpoint queued writes are replayed against.
  #[serde(default = "default_sync_endpoint")]
  pub sync_endpoint: String,

  /// Endpoint fetched on periodic sync to refresh the api cache.
  #[serde(default = "default_refresh_endpoint")]
  pub refresh_endpoint: String,

  /// Document served when a navigation request exhausts network and cache.
  /// Expected to be part of the shell manifest.
  #[serde(default = "default_offline_url")]
  pub offline_url: String,

  /// Whether activation enables navigation preload.
  #[serde(default)]
  pub navigation_preload: bool,

  /// Ordered application shell manifest, precached at install.
  #[serde(default)]
  pub shell: Vec<ShellEntry>,
}

fn default_app_name() -> String {
  "Tidecache".to_string()
}

fn default_version() -> String {
  "1.0.0".to_string()
}

fn default_api_root() -> String {
  "/api".to_string()
}

fn default_cache_prefix() -> String {
  "tc".to_string()
}

fn default_network_timeout() -> u64 {
  3000
}

fn default_api_timeout() -> u64 {
  1500
}

fn default_retry_cap() -> u32 {
  3
}

fn default_sync_tag() -> String {
  "outbox-sync".to_string()
}

fn default_periodic_sync_tag() -> String {
  "deals-refresh".to_string()
}

fn default_sync_endpoint() -> String {
  "/api/ideas".to_string()
}

fn default_refresh_endpoint() -> String {
  "/api/deals".to_string()
}

fn default_offline_url() -> String {
  "/offline.html".to_string()
}

impl EngineConfig {
  /// Configuration with defaults for everything except the origin.
  pub fn for_origin(origin: Url) -> Self {
    Self {
      app_name: default_app_name(),
      version: default_version(),
      origin,
      api_root: default_api_root(),
      cache_prefix: default_cache_prefix(),
      network_timeout_ms: default_network_timeout(),
      api_timeout_ms: default_api_timeout(),
      retry_cap: default_retry_cap(),
      sync_tag: default_sync_tag(),
      periodic_sync_tag: default_periodic_sync_tag(),
      sync_endpoint: default_sync_endpoint(),
      refresh_endpoint: default_refresh_endpoint(),
      offline_url: default_offline_url(),
      navigation_preload: false,
      shell: Vec::new(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tidecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tidecache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tidecache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tidecache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tidecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: EngineConfig = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Current namespace name for a role: `{prefix}-{role}-v{version}`.
  pub fn cache_name(&self, role: CacheRole) -> String {
    format!("{}-{}-v{}", self.cache_prefix, role.as_str(), self.version)
  }

  /// The complete current set: one namespace per role.
  pub fn current_cache_names(&self) -> Vec<String> {
    CacheRole::ALL.iter().map(|r| self.cache_name(*r)).collect()
  }

  /// Prefix that identifies namespaces owned by this engine, across all
  /// versions. Used as the GC selection boundary.
  pub fn owned_prefix(&self) -> String {
    format!("{}-", self.cache_prefix)
  }

  /// Absolute URL on the governed origin for a root-relative path.
  pub fn absolute_url(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }
}
