//! Named cached connectors and the merged views built across them.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::ci::{CachedConnector, Capability, Issue, MergeRequest, Platform, Project, UserProfile};
use crate::error::CacheError;

/// Per-platform allow-list of project IDs or paths.
///
/// A platform with no entry, or an empty entry, admits every project.
#[derive(Debug, Clone, Default)]
pub struct WatchList {
  platforms: HashMap<Platform, Vec<String>>,
}

impl WatchList {
  pub fn new(platforms: HashMap<Platform, Vec<String>>) -> Self {
    Self { platforms }
  }

  pub fn admits(&self, project: &Project) -> bool {
    match self.platforms.get(&project.platform) {
      None => true,
      Some(allowed) if allowed.is_empty() => true,
      Some(allowed) => allowed
        .iter()
        .any(|entry| *entry == project.id || *entry == project.path),
    }
  }
}

/// Registry of cached connectors keyed by instance name.
#[derive(Default)]
pub struct Registry {
  connectors: RwLock<Vec<CachedConnector>>,
  watch: WatchList,
}

impl Registry {
  pub fn new(watch: WatchList) -> Self {
    Self {
      connectors: RwLock::new(Vec::new()),
      watch,
    }
  }

  fn read(&self) -> Result<RwLockReadGuard<'_, Vec<CachedConnector>>> {
    self
      .connectors
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Register a connector. A name collision fails and keeps the first one.
  pub fn register(&self, connector: CachedConnector) -> Result<()> {
    let mut connectors = self
      .connectors
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if connectors.iter().any(|c| c.name() == connector.name()) {
      return Err(CacheError::AlreadyRegistered(connector.name().to_string()).into());
    }
    info!(connector = %connector.name(), platform = %connector.platform(), "registered connector");
    connectors.push(connector);
    Ok(())
  }

  pub fn get(&self, name: &str) -> Result<Option<CachedConnector>> {
    Ok(self.read()?.iter().find(|c| c.name() == name).cloned())
  }

  /// Every connector, in registration order.
  pub fn all(&self) -> Result<Vec<CachedConnector>> {
    Ok(self.read()?.clone())
  }

  pub fn by_platform(&self, platform: Platform) -> Result<Vec<CachedConnector>> {
    Ok(
      self
        .read()?
        .iter()
        .filter(|c| c.platform() == platform)
        .cloned()
        .collect(),
    )
  }

  /// One connector's projects, filtered by the watch-list.
  pub async fn projects_for(&self, connector: &CachedConnector) -> Result<Vec<Project>> {
    let projects = connector.get_projects().await?;
    Ok(
      projects
        .into_iter()
        .filter(|p| self.watch.admits(p))
        .collect(),
    )
  }

  /// Watched projects of every connector. Failing connectors are omitted.
  pub async fn get_all_projects(&self) -> Result<Vec<Project>> {
    let connectors = self.all()?;
    let results = join_all(connectors.iter().map(|c| self.projects_for(c))).await;
    Ok(flatten_results(&connectors, results, "get_projects"))
  }

  /// Merge requests of every watched project, across connectors that support them.
  pub async fn get_all_merge_requests(&self) -> Result<Vec<MergeRequest>> {
    self
      .fan_out_projects(Capability::MergeRequests, |c, p| async move {
        c.get_merge_requests(&p.id).await
      })
      .await
  }

  /// Issues of every watched project, across connectors that support them.
  pub async fn get_all_issues(&self) -> Result<Vec<Issue>> {
    self
      .fan_out_projects(Capability::Issues, |c, p| async move {
        c.get_issues(&p.id).await
      })
      .await
  }

  /// Current user of every connector that supports it.
  pub async fn get_current_users(&self) -> Result<Vec<UserProfile>> {
    let connectors: Vec<CachedConnector> = self
      .all()?
      .into_iter()
      .filter(|c| c.capabilities().supports(Capability::CurrentUser))
      .collect();
    let results = join_all(connectors.iter().map(|c| async move {
      c.get_current_user().await.map(|user| vec![user])
    }))
    .await;
    Ok(flatten_results(&connectors, results, "get_current_user"))
  }

  /// Per connector, call `fetch` for each watched project sequentially.
  async fn fan_out_projects<T, F, Fut>(&self, capability: Capability, fetch: F) -> Result<Vec<T>>
  where
    F: Fn(CachedConnector, Project) -> Fut + Copy,
    Fut: Future<Output = Result<Vec<T>>>,
  {
    let connectors: Vec<CachedConnector> = self
      .all()?
      .into_iter()
      .filter(|c| c.capabilities().supports(capability))
      .collect();

    let results = join_all(connectors.iter().map(|connector| async move {
      let mut items = Vec::new();
      for project in self.projects_for(connector).await? {
        items.extend(fetch(connector.clone(), project).await?);
      }
      Ok::<_, color_eyre::Report>(items)
    }))
    .await;
    Ok(flatten_results(&connectors, results, "fan-out"))
  }

  /// One-shot cold fetch: project lists, then the latest pipeline of each
  /// project's default branch. Returns the number of pipelines fetched.
  pub async fn warm_up(&self) -> Result<usize> {
    let connectors = self.all()?;
    let counts = join_all(connectors.iter().map(|connector| async move {
      let projects = match self.projects_for(connector).await {
        Ok(projects) => projects,
        Err(err) => {
          warn!(connector = %connector.name(), error = %format!("{:#}", err), "warm-up failed");
          return 0;
        }
      };

      let mut fetched = 0usize;
      for project in projects.iter().filter(|p| !p.default_branch.is_empty()) {
        match connector
          .get_latest_pipeline(&project.id, &project.default_branch)
          .await
        {
          Ok(_) => fetched += 1,
          Err(err) => debug!(
            connector = %connector.name(),
            project = %project.id,
            error = %format!("{:#}", err),
            "no pipeline during warm-up"
          ),
        }
      }
      fetched
    }))
    .await;

    let total: usize = counts.into_iter().sum();
    info!(connectors = connectors.len(), pipelines = total, "warm-up complete");
    Ok(total)
  }
}

fn flatten_results<T>(
  connectors: &[CachedConnector],
  results: Vec<Result<Vec<T>>>,
  operation: &str,
) -> Vec<T> {
  let mut merged = Vec::new();
  for (connector, result) in connectors.iter().zip(results) {
    match result {
      Ok(items) => merged.extend(items),
      Err(err) => warn!(
        connector = %connector.name(),
        operation,
        error = %format!("{:#}", err),
        "connector omitted from merged view"
      ),
    }
  }
  merged
}
