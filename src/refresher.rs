//! Background refresh of expired cache entries, with snapshot persistence
//! and startup hydration.

use async_trait::async_trait;
use color_eyre::eyre::eyre;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{FileCache, Timestamped};
use crate::ci::{CacheKey, CachedConnector, RefreshOutcome, Snapshot};
use crate::error::CacheError;
use crate::periodic::{Cycle, PeriodicTask};
use crate::registry::Registry;

pub const DEFAULT_REFRESH_WORKERS: usize = 5;

/// Loop timings and limits of the refresher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefresherSettings {
  pub interval: Duration,
  pub startup_delay: Duration,
  /// Maximum concurrent upstream refreshes per cycle
  pub workers: usize,
  /// Load the snapshot into every connector before the first cycle
  pub hydrate: bool,
}

impl Default for RefresherSettings {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(30),
      startup_delay: Duration::from_secs(2),
      workers: DEFAULT_REFRESH_WORKERS,
      hydrate: true,
    }
  }
}

/// Summary of one refresh cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
  pub checked: usize,
  pub refreshed: usize,
  /// Keys of a capability the connector lacks
  pub skipped: usize,
  pub failed: usize,
  pub persisted: bool,
}

/// How the caches were seeded at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationOutcome {
  Loaded { entities: usize, entries: usize },
  Cold,
}

pub struct ExpirationRefresher {
  registry: Arc<Registry>,
  file_cache: Option<FileCache>,
  settings: RefresherSettings,
}

impl ExpirationRefresher {
  pub fn new(registry: Arc<Registry>, settings: RefresherSettings) -> Self {
    Self {
      registry,
      file_cache: None,
      settings,
    }
  }

  /// Persist a snapshot after every productive cycle and hydrate from it.
  pub fn with_file_cache(mut self, file_cache: FileCache) -> Self {
    self.file_cache = Some(file_cache);
    self
  }

  /// Hydrate (or kick off a cold fetch), then run cycles until stopped.
  pub fn start(self) -> PeriodicTask<Self> {
    let outcome = if self.settings.hydrate {
      self.hydrate()
    } else {
      HydrationOutcome::Cold
    };

    if outcome == HydrationOutcome::Cold {
      let registry = Arc::clone(&self.registry);
      tokio::spawn(async move {
        if let Err(err) = registry.warm_up().await {
          warn!(error = %format!("{:#}", err), "cold fetch failed");
        }
      });
    }

    let interval = self.settings.interval;
    let startup_delay = self.settings.startup_delay;
    PeriodicTask::spawn(self, interval, startup_delay)
  }

  /// Load the snapshot and populate every registered connector.
  ///
  /// A missing, unreadable or corrupt snapshot is a cold start.
  pub fn hydrate(&self) -> HydrationOutcome {
    let Some(file_cache) = &self.file_cache else {
      return HydrationOutcome::Cold;
    };

    let snapshot: Snapshot = match file_cache.load() {
      Ok(Some(snapshot)) => snapshot,
      Ok(None) => {
        info!(path = %file_cache.path().display(), "no snapshot, starting cold");
        return HydrationOutcome::Cold;
      }
      Err(err) => {
        let corrupt = matches!(
          err.downcast_ref::<CacheError>(),
          Some(CacheError::CorruptSnapshot { .. })
        );
        warn!(corrupt, error = %format!("{:#}", err), "ignoring snapshot, starting cold");
        return HydrationOutcome::Cold;
      }
    };

    let connectors = match self.registry.all() {
      Ok(connectors) => connectors,
      Err(err) => {
        warn!(error = %format!("{:#}", err), "cannot hydrate");
        return HydrationOutcome::Cold;
      }
    };

    let mut entries = 0;
    for connector in &connectors {
      match connector.populate_snapshot(&snapshot) {
        Ok(count) => entries += count,
        Err(err) => warn!(
          connector = %connector.name(),
          error = %format!("{:#}", err),
          "hydration failed"
        ),
      }
    }

    let entities = snapshot.entity_count();
    info!(
      entities,
      entries,
      saved_at = %snapshot.timestamp(),
      "hydrated caches from snapshot"
    );
    HydrationOutcome::Loaded { entities, entries }
  }

  /// Refresh every expired key once, then persist if anything changed.
  pub async fn refresh_once(&self) -> CycleReport {
    let mut report = CycleReport::default();

    let connectors = match self.registry.all() {
      Ok(connectors) => connectors,
      Err(err) => {
        warn!(error = %format!("{:#}", err), "cannot list connectors");
        return report;
      }
    };

    let mut work: Vec<(CachedConnector, CacheKey)> = Vec::new();
    for connector in &connectors {
      let keys = match connector.get_expired_keys() {
        Ok(keys) => keys,
        Err(err) => {
          warn!(
            connector = %connector.name(),
            error = %format!("{:#}", err),
            "cannot enumerate expired keys"
          );
          continue;
        }
      };
      // Keys a stale reader claimed in the meantime are refreshed by that reader
      for key in keys {
        match connector.claim_refresh(&key) {
          Ok(true) => work.push((connector.clone(), key)),
          Ok(false) => debug!(connector = %connector.name(), key = %key, "refresh already in flight"),
          Err(err) => warn!(
            connector = %connector.name(),
            key = %key,
            error = %format!("{:#}", err),
            "cannot claim refresh"
          ),
        }
      }
    }
    report.checked = work.len();
    if work.is_empty() {
      return report;
    }

    let gate = Arc::new(Semaphore::new(self.settings.workers.max(1)));
    let outcomes = join_all(work.iter().map(|(connector, key)| {
      let gate = Arc::clone(&gate);
      async move {
        let _permit = gate
          .acquire()
          .await
          .map_err(|e| eyre!("Refresh gate closed: {}", e))?;
        connector.force_refresh(key).await
      }
    }))
    .await;

    for ((connector, key), outcome) in work.iter().zip(outcomes) {
      match outcome {
        Ok(RefreshOutcome::Refreshed) => report.refreshed += 1,
        Ok(RefreshOutcome::Unsupported) => report.skipped += 1,
        Err(err) if CacheError::is_unsupported(&err) => report.skipped += 1,
        Err(err) => {
          report.failed += 1;
          warn!(
            connector = %connector.name(),
            key = %key,
            error = %format!("{:#}", err),
            "refresh failed"
          );
        }
      }
    }

    if report.refreshed > 0 {
      report.persisted = self.persist(&connectors).await;
    }
    report
  }

  async fn persist(&self, connectors: &[CachedConnector]) -> bool {
    let Some(file_cache) = self.file_cache.clone() else {
      return false;
    };

    let mut snapshot = Snapshot::default();
    for connector in connectors {
      match connector.export() {
        Ok(part) => snapshot.merge(part),
        Err(err) => warn!(
          connector = %connector.name(),
          error = %format!("{:#}", err),
          "export failed"
        ),
      }
    }

    let saved = tokio::task::spawn_blocking(move || file_cache.save(&mut snapshot))
      .await
      .map_err(|e| eyre!("Snapshot task failed: {}", e))
      .and_then(|result| result);
    match saved {
      Ok(()) => true,
      Err(err) => {
        warn!(error = %format!("{:#}", err), "failed to persist snapshot");
        false
      }
    }
  }
}

#[async_trait]
impl Cycle for ExpirationRefresher {
  fn name(&self) -> &'static str {
    "expiration-refresher"
  }

  async fn run_cycle(&mut self) {
    let report = self.refresh_once().await;
    if report.checked == 0 {
      debug!("no expired keys");
      return;
    }
    info!(
      checked = report.checked,
      refreshed = report.refreshed,
      skipped = report.skipped,
      failed = report.failed,
      persisted = report.persisted,
      "refresh cycle complete"
    );
  }
}
