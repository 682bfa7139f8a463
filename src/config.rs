use chrono::Duration as ChronoDuration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CachePolicy, FileCache};
use crate::ci::{CachedConnector, Connector, Platform, DEFAULT_POPULATE_LIMIT};
use crate::refresher::{RefresherSettings, DEFAULT_REFRESH_WORKERS};
use crate::registry::WatchList;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  /// Project IDs or paths to watch per platform (all projects when absent)
  #[serde(default)]
  pub watch: HashMap<Platform, Vec<String>>,
}

/// Cache TTLs and loop timings. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_fresh_ttl: u64,
  /// Per-platform override of `default_fresh_ttl`
  pub fresh_ttl: HashMap<Platform, u64>,
  pub stale_ttl: u64,
  pub refresh_interval: u64,
  pub event_poll_interval: u64,
  pub startup_delay: u64,
  pub refresh_workers: usize,
  pub populate_limit: usize,
  pub hydrate: bool,
  /// Snapshot location (defaults to the user cache directory)
  pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_fresh_ttl: 60,
      fresh_ttl: HashMap::new(),
      stale_ttl: 3600,
      refresh_interval: 30,
      event_poll_interval: 60,
      startup_delay: 2,
      refresh_workers: DEFAULT_REFRESH_WORKERS,
      populate_limit: DEFAULT_POPULATE_LIMIT,
      hydrate: true,
      snapshot_path: None,
    }
  }
}

impl CacheConfig {
  /// Cache policy for connectors of one platform.
  pub fn policy_for(&self, platform: Platform) -> CachePolicy {
    let fresh = self
      .fresh_ttl
      .get(&platform)
      .copied()
      .unwrap_or(self.default_fresh_ttl);
    CachePolicy::new(seconds(fresh), seconds(self.stale_ttl))
  }

  /// Wrap a connector with the policy of its platform.
  pub fn wrap(&self, name: impl Into<String>, inner: Arc<dyn Connector>) -> CachedConnector {
    let policy = self.policy_for(inner.platform());
    CachedConnector::new(name, inner, policy).with_populate_limit(self.populate_limit.max(1))
  }

  pub fn refresher_settings(&self) -> RefresherSettings {
    RefresherSettings {
      interval: Duration::from_secs(self.refresh_interval.max(1)),
      startup_delay: Duration::from_secs(self.startup_delay),
      workers: self.refresh_workers.max(1),
      hydrate: self.hydrate,
    }
  }

  pub fn poller_interval(&self) -> Duration {
    Duration::from_secs(self.event_poll_interval.max(1))
  }

  pub fn file_cache(&self) -> Result<FileCache> {
    let path = match &self.snapshot_path {
      Some(path) => path.clone(),
      None => FileCache::default_path()?,
    };
    Ok(FileCache::new(path))
  }
}

/// Ten years; longer TTLs are clamped
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

fn seconds(secs: u64) -> ChronoDuration {
  ChronoDuration::seconds(secs.min(MAX_TTL_SECS) as i64)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ciwatch.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ciwatch/config.yaml
  ///
  /// Without any file every setting takes its default.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ciwatch.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ciwatch").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  pub fn watch_list(&self) -> WatchList {
    WatchList::new(self.watch.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_document_uses_defaults() {
    let config = Config::parse("{}").unwrap();

    assert_eq!(config.cache.stale_ttl, 3600);
    assert_eq!(config.cache.refresh_workers, 5);
    assert!(config.cache.hydrate);
    assert!(config.watch.is_empty());
    assert_eq!(
      config.cache.policy_for(Platform::Gitlab),
      CachePolicy::default()
    );
  }

  #[test]
  fn test_per_platform_fresh_ttl() {
    let config = Config::parse(
      r#"
cache:
  default_fresh_ttl: 45
  fresh_ttl:
    github: 120
  stale_ttl: 600
watch:
  gitlab: ["group/app", "42"]
"#,
    )
    .unwrap();

    let github = config.cache.policy_for(Platform::Github);
    assert_eq!(github.fresh_ttl, ChronoDuration::seconds(120));
    assert_eq!(github.stale_ttl, ChronoDuration::seconds(600));
    assert_eq!(
      config.cache.policy_for(Platform::Gitlab).fresh_ttl,
      ChronoDuration::seconds(45)
    );
    assert_eq!(config.watch[&Platform::Gitlab].len(), 2);

    let watch = config.watch_list();
    assert!(watch.admits(&crate::ci::testing::project("42")));
    assert!(!watch.admits(&crate::ci::testing::project("7")));
  }

  #[test]
  fn test_loop_settings() {
    let config = Config::parse(
      r#"
cache:
  refresh_interval: 10
  event_poll_interval: 0
  refresh_workers: 0
  hydrate: false
"#,
    )
    .unwrap();

    let settings = config.cache.refresher_settings();
    assert_eq!(settings.interval, Duration::from_secs(10));
    assert_eq!(settings.workers, 1);
    assert!(!settings.hydrate);
    assert_eq!(config.cache.poller_interval(), Duration::from_secs(1));
  }

  #[test]
  fn test_wrap_applies_platform_policy() {
    let config = Config::parse("cache:\n  fresh_ttl:\n    github: 5\n").unwrap();
    let inner = Arc::new(crate::ci::testing::MockConnector::new(Platform::Github));

    let connector = config.cache.wrap("gh", inner);

    assert_eq!(connector.name(), "gh");
    assert_eq!(connector.policy().fresh_ttl, ChronoDuration::seconds(5));
  }

  #[test]
  fn test_unknown_platform_is_rejected() {
    assert!(Config::parse("watch:\n  bitbucket: [\"a\"]\n").is_err());
  }

  #[test]
  fn test_explicit_path_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(Config::load(Some(&missing)).is_err());

    let present = dir.path().join("ciwatch.yaml");
    std::fs::write(&present, "cache:\n  stale_ttl: 10\n").unwrap();
    assert_eq!(Config::load(Some(&present)).unwrap().cache.stale_ttl, 10);
  }
}
