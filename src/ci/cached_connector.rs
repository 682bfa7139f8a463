//! Cached connector that wraps a platform connector with stale-while-revalidate caching.

use chrono::{DateTime, Utc};
use color_eyre::{Report, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheLayer, CachePolicy, CacheResult, Cacheable, Freshness, Lookup};
use crate::error::CacheError;

use super::cache::{CacheKey, CachedValue};
use super::connector::{Capabilities, Capability, Connector, ExtendedConnector, UserConnector};
use super::snapshot::Snapshot;
use super::types::{Branch, Event, Issue, MergeRequest, Pipeline, Platform, Project, UserProfile};

/// List length used for entries seeded from a snapshot.
pub const DEFAULT_POPULATE_LIMIT: usize = 20;

/// Result of a forced refresh that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
  Refreshed,
  /// The key belongs to a capability the connector lacks; nothing was fetched
  Unsupported,
}

/// Connector with transparent caching.
///
/// This wraps a [`Connector`] and provides the same capability set. Fresh
/// entries are served without an upstream call, stale entries are served
/// while one background refresh runs, and missing or expired entries are
/// fetched synchronously.
#[derive(Clone)]
pub struct CachedConnector {
  name: String,
  inner: Arc<dyn Connector>,
  capabilities: Capabilities,
  cache: CacheLayer<CacheKey, CachedValue>,
  populate_limit: usize,
}

impl CachedConnector {
  pub fn new(name: impl Into<String>, inner: Arc<dyn Connector>, policy: CachePolicy) -> Self {
    let capabilities = Capabilities::probe(inner.as_ref());
    Self {
      name: name.into(),
      inner,
      capabilities,
      cache: CacheLayer::new(policy),
      populate_limit: DEFAULT_POPULATE_LIMIT,
    }
  }

  /// Set the list limit of entries seeded by the `populate_*` methods.
  pub fn with_populate_limit(mut self, limit: usize) -> Self {
    self.populate_limit = limit;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn platform(&self) -> Platform {
    self.inner.platform()
  }

  pub fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  pub fn policy(&self) -> &CachePolicy {
    self.cache.policy()
  }

  // ==========================================================================
  // Capability set
  // ==========================================================================

  pub async fn get_projects(&self) -> Result<Vec<Project>> {
    Ok(self.fetch(CacheKey::Projects).await?.data)
  }

  pub async fn get_project_count(&self) -> Result<usize> {
    Ok(self.fetch(CacheKey::ProjectCount).await?.data)
  }

  pub async fn get_latest_pipeline(&self, project_id: &str, branch: &str) -> Result<Pipeline> {
    let key = CacheKey::LatestPipeline {
      project_id: project_id.to_string(),
      branch: branch.to_string(),
    };
    Ok(self.fetch(key).await?.data)
  }

  pub async fn get_pipelines(&self, project_id: &str, limit: usize) -> Result<Vec<Pipeline>> {
    let key = CacheKey::Pipelines {
      project_id: project_id.to_string(),
      limit,
    };
    Ok(self.fetch(key).await?.data)
  }

  pub async fn get_branches(&self, project_id: &str, limit: usize) -> Result<Vec<Branch>> {
    let key = CacheKey::Branches {
      project_id: project_id.to_string(),
      limit,
    };
    Ok(self.fetch(key).await?.data)
  }

  pub async fn get_branch(&self, project_id: &str, branch: &str) -> Result<Branch> {
    let key = CacheKey::Branch {
      project_id: project_id.to_string(),
      branch: branch.to_string(),
    };
    Ok(self.fetch(key).await?.data)
  }

  pub async fn get_merge_requests(&self, project_id: &str) -> Result<Vec<MergeRequest>> {
    self.require(Capability::MergeRequests)?;
    let key = CacheKey::MergeRequests {
      project_id: project_id.to_string(),
    };
    Ok(self.fetch(key).await?.data)
  }

  pub async fn get_issues(&self, project_id: &str) -> Result<Vec<Issue>> {
    self.require(Capability::Issues)?;
    let key = CacheKey::Issues {
      project_id: project_id.to_string(),
    };
    Ok(self.fetch(key).await?.data)
  }

  pub async fn get_current_user(&self) -> Result<UserProfile> {
    self.require(Capability::CurrentUser)?;
    Ok(self.fetch(CacheKey::CurrentUser).await?.data)
  }

  /// Activity events since `since` (not cached).
  pub async fn get_events(&self, project_id: &str, since: DateTime<Utc>) -> Result<Vec<Event>> {
    self.require(Capability::Events)?;
    let events = self
      .inner
      .as_events()
      .ok_or_else(|| self.unsupported(Capability::Events))?;
    events.get_events(project_id, since).await
  }

  /// Read a key through the cache, reporting where the value came from.
  pub async fn fetch<T: Cacheable<CachedValue>>(&self, key: CacheKey) -> Result<CacheResult<T>> {
    let result = match self.cache.lookup(&key)? {
      Lookup::Fresh { value, fetched_at } => {
        debug!(connector = %self.name, key = %key, "cache hit");
        CacheResult::from_cache(value, fetched_at, false)
      }
      Lookup::Stale {
        value,
        fetched_at,
        schedule_refresh,
      } => {
        if schedule_refresh {
          debug!(connector = %self.name, key = %key, "stale hit, scheduling refresh");
          self.spawn_refresh(key.clone());
        }
        CacheResult::from_cache(value, fetched_at, true)
      }
      Lookup::Expired { .. } | Lookup::Missing => self.fetch_through(&key).await?,
    };

    let data = T::from_cached(result.data).ok_or_else(|| CacheError::TypeMismatch {
      key: key.to_string(),
      expected: T::kind(),
    })?;
    Ok(CacheResult {
      data,
      source: result.source,
      fetched_at: result.fetched_at,
    })
  }

  /// Synchronous fetch for a missing or expired key. Falls back to the prior
  /// value when the upstream call fails.
  async fn fetch_through(&self, key: &CacheKey) -> Result<CacheResult<CachedValue>> {
    let flight = self.cache.flight(key)?;
    let _guard = flight.lock().await;

    // Another caller may have completed the fetch while we waited
    if let Some(entry) = self.cache.entry(key)? {
      match entry.freshness(Utc::now()) {
        Freshness::Fresh => return Ok(CacheResult::from_cache(entry.value, entry.fetched_at, false)),
        Freshness::Stale => return Ok(CacheResult::from_cache(entry.value, entry.fetched_at, true)),
        Freshness::Expired => {}
      }
    }

    debug!(connector = %self.name, key = %key, "cache miss");
    match self.dispatch(key).await {
      Ok(value) => {
        self.cache.store(key.clone(), value.clone())?;
        Ok(CacheResult::from_network(value))
      }
      Err(err) => match self.cache.entry(key)? {
        Some(prior) => {
          warn!(
            connector = %self.name,
            key = %key,
            error = %format!("{:#}", err),
            "upstream fetch failed, serving last known value"
          );
          self.cache.record_error(key, format!("{:#}", err))?;
          Ok(CacheResult::fallback(prior.value, prior.fetched_at))
        }
        None => Err(err),
      },
    }
  }

  fn spawn_refresh(&self, key: CacheKey) {
    let this = self.clone();
    tokio::spawn(async move {
      if let Err(err) = this.revalidate(&key).await {
        warn!(
          connector = %this.name,
          key = %key,
          error = %format!("{:#}", err),
          "background refresh failed"
        );
      }
    });
  }

  /// Call the connector method a key stands for.
  async fn dispatch(&self, key: &CacheKey) -> Result<CachedValue> {
    let value = match key {
      CacheKey::Projects => self.inner.get_projects().await?.into_cached(),
      CacheKey::ProjectCount => self.inner.get_project_count().await?.into_cached(),
      CacheKey::LatestPipeline { project_id, branch } => self
        .inner
        .get_latest_pipeline(project_id, branch)
        .await?
        .into_cached(),
      CacheKey::Pipelines { project_id, limit } => self
        .inner
        .get_pipelines(project_id, *limit)
        .await?
        .into_cached(),
      CacheKey::Branches { project_id, limit } => self
        .inner
        .get_branches(project_id, *limit)
        .await?
        .into_cached(),
      CacheKey::Branch { project_id, branch } => self
        .inner
        .get_branch(project_id, branch)
        .await?
        .into_cached(),
      CacheKey::MergeRequests { project_id } => self
        .extended(Capability::MergeRequests)?
        .get_merge_requests(project_id)
        .await?
        .into_cached(),
      CacheKey::Issues { project_id } => self
        .extended(Capability::Issues)?
        .get_issues(project_id)
        .await?
        .into_cached(),
      CacheKey::CurrentUser => self.user()?.get_current_user().await?.into_cached(),
    };
    Ok(value)
  }

  fn require(&self, capability: Capability) -> Result<()> {
    if self.capabilities.supports(capability) {
      Ok(())
    } else {
      Err(self.unsupported(capability))
    }
  }

  fn unsupported(&self, capability: Capability) -> Report {
    CacheError::Unsupported {
      connector: self.name.clone(),
      capability,
    }
    .into()
  }

  fn extended(&self, capability: Capability) -> Result<&dyn ExtendedConnector> {
    self.require(capability)?;
    self
      .inner
      .as_extended()
      .ok_or_else(|| self.unsupported(capability))
  }

  fn user(&self) -> Result<&dyn UserConnector> {
    self.require(Capability::CurrentUser)?;
    self
      .inner
      .as_user()
      .ok_or_else(|| self.unsupported(Capability::CurrentUser))
  }

  // ==========================================================================
  // Control operations
  // ==========================================================================

  /// Keys past their fresh TTL with no refresh in flight.
  ///
  /// Global keys come first, then project keys ordered by the project's last
  /// activity (most recent first, unknown last).
  pub fn get_expired_keys(&self) -> Result<Vec<CacheKey>> {
    let mut keys = self.cache.expired_keys()?;
    let activity = self.project_activity()?;

    let rank = |key: &CacheKey| match key.project_id() {
      None => (0, None),
      Some(project_id) => (1, activity.get(project_id).copied()),
    };
    keys.sort_by(|a, b| {
      let (scope_a, active_a) = rank(a);
      let (scope_b, active_b) = rank(b);
      scope_a
        .cmp(&scope_b)
        .then_with(|| active_b.cmp(&active_a))
        .then_with(|| a.to_string().cmp(&b.to_string()))
    });
    Ok(keys)
  }

  fn project_activity(&self) -> Result<HashMap<String, DateTime<Utc>>> {
    let activity = match self.cache.entry(&CacheKey::Projects)? {
      Some(CacheEntry {
        value: CachedValue::Projects(projects),
        ..
      }) => projects
        .into_iter()
        .filter_map(|p| p.last_activity.map(|at| (p.id, at)))
        .collect(),
      _ => HashMap::new(),
    };
    Ok(activity)
  }

  /// Claim the refresh of a cached key so stale readers do not schedule a
  /// second one. The claim ends when the key is stored, fails or is released.
  pub fn claim_refresh(&self, key: &CacheKey) -> Result<bool> {
    self.cache.claim(key)
  }

  /// Re-fetch a key regardless of freshness and replace its entry.
  pub async fn force_refresh(&self, key: &CacheKey) -> Result<RefreshOutcome> {
    if !self.supports_key(key)? {
      return Ok(RefreshOutcome::Unsupported);
    }

    let flight = self.cache.flight(key)?;
    let _guard = flight.lock().await;
    self.refresh_locked(key).await
  }

  /// Background refresh for a claimed stale key. Skips the upstream call when
  /// another fetch made the entry fresh while this one waited for the lock.
  async fn revalidate(&self, key: &CacheKey) -> Result<RefreshOutcome> {
    if !self.supports_key(key)? {
      return Ok(RefreshOutcome::Unsupported);
    }

    let flight = self.cache.flight(key)?;
    let _guard = flight.lock().await;

    if let Some(entry) = self.cache.entry(key)? {
      if entry.freshness(Utc::now()) == Freshness::Fresh {
        self.cache.release(key)?;
        debug!(connector = %self.name, key = %key, "already fresh, refresh skipped");
        return Ok(RefreshOutcome::Refreshed);
      }
    }
    self.refresh_locked(key).await
  }

  /// Capability check for a key; releases any claim on an unsupported key.
  fn supports_key(&self, key: &CacheKey) -> Result<bool> {
    match key.capability() {
      Some(capability) if !self.capabilities.supports(capability) => {
        self.cache.release(key)?;
        Ok(false)
      }
      _ => Ok(true),
    }
  }

  /// Fetch and store a key. The caller holds the key's flight lock.
  async fn refresh_locked(&self, key: &CacheKey) -> Result<RefreshOutcome> {
    match self.dispatch(key).await {
      Ok(value) => {
        self.cache.store(key.clone(), value)?;
        debug!(connector = %self.name, key = %key, "refreshed");
        Ok(RefreshOutcome::Refreshed)
      }
      Err(err) => {
        self.cache.record_error(key, format!("{:#}", err))?;
        Err(err)
      }
    }
  }

  pub fn invalidate(&self, key: &CacheKey) -> Result<bool> {
    let removed = self.cache.invalidate(key)?;
    debug!(connector = %self.name, key = %key, removed, "invalidated");
    Ok(removed)
  }

  /// Drop every entry whose rendered key starts with `prefix`.
  pub fn invalidate_pattern(&self, prefix: &str) -> Result<usize> {
    let removed = self.cache.invalidate_prefix(prefix)?;
    debug!(connector = %self.name, prefix, removed, "invalidated by prefix");
    Ok(removed)
  }

  /// Entry metadata for observability.
  pub fn entry(&self, key: &CacheKey) -> Result<Option<CacheEntry<CachedValue>>> {
    self.cache.entry(key)
  }

  pub fn len(&self) -> Result<usize> {
    self.cache.len()
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.cache.len()? == 0)
  }

  // ==========================================================================
  // Bulk population (cold-start hydration only, last write wins)
  // ==========================================================================

  /// Whether a persisted record belongs to this connector.
  fn owns(&self, connector: &str, platform: Platform) -> bool {
    if connector.is_empty() {
      platform == self.platform()
    } else {
      connector == self.name
    }
  }

  pub fn populate_projects(&self, projects: Vec<Project>) -> Result<usize> {
    let projects: Vec<Project> = projects
      .into_iter()
      .filter(|p| self.owns(&p.connector, p.platform))
      .collect();
    if projects.is_empty() {
      return Ok(0);
    }
    self
      .cache
      .populate([(CacheKey::Projects, projects.into_cached())])
  }

  pub fn populate_pipelines(&self, pipelines: Vec<Pipeline>) -> Result<usize> {
    let owned = pipelines
      .into_iter()
      .filter(|p| self.owns(&p.connector, p.platform));

    let mut items = Vec::new();
    for (project_id, mut list) in group_by_project(owned, |p| &p.project_id) {
      list.sort_by(|a, b| b.created_at.cmp(&a.created_at));

      let mut latest: BTreeMap<String, Pipeline> = BTreeMap::new();
      for pipeline in &list {
        latest
          .entry(pipeline.git_ref.clone())
          .or_insert_with(|| pipeline.clone());
      }
      for (branch, pipeline) in latest {
        let key = CacheKey::LatestPipeline {
          project_id: project_id.clone(),
          branch,
        };
        items.push((key, pipeline.into_cached()));
      }

      list.truncate(self.populate_limit);
      let key = CacheKey::Pipelines {
        project_id,
        limit: self.populate_limit,
      };
      items.push((key, list.into_cached()));
    }
    self.cache.populate(items)
  }

  pub fn populate_branches(&self, branches: Vec<Branch>) -> Result<usize> {
    let owned = branches
      .into_iter()
      .filter(|b| self.owns(&b.connector, b.platform));

    let mut items = Vec::new();
    for (project_id, mut list) in group_by_project(owned, |b| &b.project_id) {
      for branch in &list {
        let key = CacheKey::Branch {
          project_id: project_id.clone(),
          branch: branch.name.clone(),
        };
        items.push((key, branch.clone().into_cached()));
      }

      list.truncate(self.populate_limit);
      let key = CacheKey::Branches {
        project_id,
        limit: self.populate_limit,
      };
      items.push((key, list.into_cached()));
    }
    self.cache.populate(items)
  }

  pub fn populate_merge_requests(&self, merge_requests: Vec<MergeRequest>) -> Result<usize> {
    if !self.capabilities.merge_requests {
      return Ok(0);
    }
    let owned = merge_requests
      .into_iter()
      .filter(|mr| self.owns(&mr.connector, mr.platform));
    let items = group_by_project(owned, |mr| &mr.project_id)
      .into_iter()
      .map(|(project_id, list)| (CacheKey::MergeRequests { project_id }, list.into_cached()));
    self.cache.populate(items)
  }

  pub fn populate_issues(&self, issues: Vec<Issue>) -> Result<usize> {
    if !self.capabilities.issues {
      return Ok(0);
    }
    let owned = issues
      .into_iter()
      .filter(|issue| self.owns(&issue.connector, issue.platform));
    let items = group_by_project(owned, |issue| &issue.project_id)
      .into_iter()
      .map(|(project_id, list)| (CacheKey::Issues { project_id }, list.into_cached()));
    self.cache.populate(items)
  }

  pub fn populate_user_profiles(&self, profiles: Vec<UserProfile>) -> Result<usize> {
    if !self.capabilities.current_user {
      return Ok(0);
    }
    let items = profiles
      .into_iter()
      .find(|u| self.owns(&u.connector, u.platform))
      .map(|u| (CacheKey::CurrentUser, u.into_cached()));
    self.cache.populate(items)
  }

  /// Seed every collection of a snapshot. Returns the number of entries written.
  pub fn populate_snapshot(&self, snapshot: &Snapshot) -> Result<usize> {
    Ok(
      self.populate_projects(snapshot.projects.clone())?
        + self.populate_pipelines(snapshot.pipelines.clone())?
        + self.populate_branches(snapshot.branches.clone())?
        + self.populate_merge_requests(snapshot.merge_requests.clone())?
        + self.populate_issues(snapshot.issues.clone())?
        + self.populate_user_profiles(snapshot.user_profiles.clone())?,
    )
  }

  /// Every cached entity, stamped with this connector's name.
  pub fn export(&self) -> Result<Snapshot> {
    let mut projects = Vec::new();
    let mut pipelines = BTreeMap::new();
    let mut branches = BTreeMap::new();
    let mut merge_requests = BTreeMap::new();
    let mut issues = BTreeMap::new();
    let mut user_profiles = Vec::new();

    for (_, value) in self.cache.values()? {
      match value {
        CachedValue::Projects(list) => projects = list,
        CachedValue::ProjectCount(_) => {}
        CachedValue::Pipeline(p) => {
          pipelines.insert((p.project_id.clone(), p.id.clone()), p);
        }
        CachedValue::Pipelines(list) => {
          for p in list {
            pipelines.insert((p.project_id.clone(), p.id.clone()), p);
          }
        }
        CachedValue::Branch(b) => {
          branches.insert((b.project_id.clone(), b.name.clone()), b);
        }
        CachedValue::Branches(list) => {
          for b in list {
            branches.insert((b.project_id.clone(), b.name.clone()), b);
          }
        }
        CachedValue::MergeRequests(list) => {
          for mr in list {
            merge_requests.insert((mr.project_id.clone(), mr.id.clone()), mr);
          }
        }
        CachedValue::Issues(list) => {
          for issue in list {
            issues.insert((issue.project_id.clone(), issue.id.clone()), issue);
          }
        }
        CachedValue::User(u) => user_profiles = vec![u],
      }
    }

    let name = &self.name;
    let mut snapshot = Snapshot {
      projects,
      pipelines: pipelines.into_values().collect(),
      branches: branches.into_values().collect(),
      merge_requests: merge_requests.into_values().collect(),
      issues: issues.into_values().collect(),
      user_profiles,
      ..Default::default()
    };
    snapshot.projects.iter_mut().for_each(|p| p.connector = name.clone());
    snapshot.pipelines.iter_mut().for_each(|p| p.connector = name.clone());
    snapshot.branches.iter_mut().for_each(|b| b.connector = name.clone());
    snapshot
      .merge_requests
      .iter_mut()
      .for_each(|mr| mr.connector = name.clone());
    snapshot.issues.iter_mut().for_each(|i| i.connector = name.clone());
    snapshot
      .user_profiles
      .iter_mut()
      .for_each(|u| u.connector = name.clone());
    Ok(snapshot)
  }
}

fn group_by_project<T>(
  items: impl IntoIterator<Item = T>,
  project_of: impl Fn(&T) -> &String,
) -> BTreeMap<String, Vec<T>> {
  let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
  for item in items {
    groups.entry(project_of(&item).clone()).or_default().push(item);
  }
  groups
}
