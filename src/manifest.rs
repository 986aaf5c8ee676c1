//! Application shell manifest.
//!
//! An ordered list of URLs that must be cached for the app to render its
//! baseline UI offline. Entries may carry a content revision; a `None`
//! revision means the URL already embeds a content hash and needs no
//! separate invalidation key.

use serde::{Deserialize, Serialize};

/// One shell resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellEntry {
  pub url: String,
  #[serde(default)]
  pub revision: Option<String>,
}

impl ShellEntry {
  pub fn new(url: &str) -> Self {
    Self {
      url: url.to_string(),
      revision: None,
    }
  }

  pub fn with_revision(url: &str, revision: &str) -> Self {
    Self {
      url: url.to_string(),
      revision: Some(revision.to_string()),
    }
  }

  /// URL to fetch at install time. The revision rides along as a query
  /// parameter so a changed resource busts intermediate HTTP caches, while
  /// the cache entry itself stays keyed on the plain URL.
  pub fn precache_url(&self) -> String {
    match &self.revision {
      Some(revision) => {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}__rev={}", self.url, separator, revision)
      }
      None => self.url.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_precache_url_without_revision_is_unchanged() {
    let entry = ShellEntry::new("/src/app.js");
    assert_eq!(entry.precache_url(), "/src/app.js");
  }

  #[test]
  fn test_precache_url_appends_revision() {
    let entry = ShellEntry::with_revision("/src/styles.css", "def456");
    assert_eq!(entry.precache_url(), "/src/styles.css?__rev=def456");
  }

  #[test]
  fn test_precache_url_respects_existing_query() {
    let entry = ShellEntry::with_revision("/view?page=home", "abc123");
    assert_eq!(entry.precache_url(), "/view?page=home&__rev=abc123");
  }
}
