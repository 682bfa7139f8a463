//! Turns upstream activity events into targeted cache invalidations.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ci::{CacheKey, CachedConnector, Capability, Event, RefreshOutcome};
use crate::error::CacheError;
use crate::periodic::{Cycle, PeriodicTask};
use crate::registry::Registry;

const PUSH_EVENTS: &[&str] = &["pushed to", "pushed new", "pushevent"];
const MERGE_REQUEST_EVENTS: &[&str] = &[
  "opened",
  "closed",
  "merged",
  "accepted",
  "pullrequestevent",
];
const ISSUE_EVENTS: &[&str] = &["issuesevent"];
const WORKFLOW_EVENTS: &[&str] = &["workflowrunevent"];

/// One cache action derived from an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
  /// Drop the key and fetch it again right away
  Refresh(CacheKey),
  /// Drop every key starting with the prefix
  Prefix(String),
}

/// Cache actions for one event, empty for unrecognized types.
pub fn plan_invalidations(project_id: &str, event: &Event) -> Vec<Invalidation> {
  let kind = event.kind.to_lowercase();
  let is = |group: &[&str]| group.contains(&kind.as_str());

  if is(PUSH_EVENTS) {
    let mut plan = Vec::new();
    let branch = event
      .target_ref
      .strip_prefix("refs/heads/")
      .unwrap_or(&event.target_ref);
    if !branch.is_empty() {
      plan.push(Invalidation::Refresh(CacheKey::LatestPipeline {
        project_id: project_id.to_string(),
        branch: branch.to_string(),
      }));
    }
    plan.push(Invalidation::Prefix(CacheKey::branches_prefix(project_id)));
    plan
  } else if is(MERGE_REQUEST_EVENTS) {
    vec![Invalidation::Refresh(CacheKey::MergeRequests {
      project_id: project_id.to_string(),
    })]
  } else if is(ISSUE_EVENTS) {
    vec![Invalidation::Refresh(CacheKey::Issues {
      project_id: project_id.to_string(),
    })]
  } else if is(WORKFLOW_EVENTS) {
    vec![Invalidation::Prefix(CacheKey::pipelines_prefix(project_id))]
  } else {
    Vec::new()
  }
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
  pub events: usize,
  pub invalidated: usize,
  pub refreshed: usize,
}

pub struct EventPoller {
  registry: Arc<Registry>,
  /// Newest event seen per (connector, project)
  last_seen: HashMap<(String, String), DateTime<Utc>>,
  lookback: ChronoDuration,
}

impl EventPoller {
  pub fn new(registry: Arc<Registry>) -> Self {
    Self {
      registry,
      last_seen: HashMap::new(),
      lookback: ChronoDuration::hours(1),
    }
  }

  pub fn last_seen(&self, connector: &str, project_id: &str) -> Option<DateTime<Utc>> {
    self
      .last_seen
      .get(&(connector.to_string(), project_id.to_string()))
      .copied()
  }

  /// Run poll cycles every `interval` until stopped. The first poll is immediate.
  pub fn start(self, interval: Duration) -> PeriodicTask<Self> {
    PeriodicTask::spawn(self, interval, Duration::ZERO)
  }

  /// Poll every watched project of every connector with the events capability.
  pub async fn poll_once(&mut self) -> PollReport {
    let mut report = PollReport::default();

    let connectors = match self.registry.all() {
      Ok(connectors) => connectors,
      Err(err) => {
        warn!(error = %format!("{:#}", err), "cannot list connectors");
        return report;
      }
    };

    for connector in connectors
      .iter()
      .filter(|c| c.capabilities().supports(Capability::Events))
    {
      let projects = match self.registry.projects_for(connector).await {
        Ok(projects) => projects,
        Err(err) => {
          warn!(
            connector = %connector.name(),
            error = %format!("{:#}", err),
            "cannot list projects for event poll"
          );
          continue;
        }
      };

      for project in &projects {
        self.poll_project(connector, &project.id, &mut report).await;
      }
    }
    report
  }

  async fn poll_project(
    &mut self,
    connector: &CachedConnector,
    project_id: &str,
    report: &mut PollReport,
  ) {
    let slot = (connector.name().to_string(), project_id.to_string());
    let since = self
      .last_seen
      .get(&slot)
      .copied()
      .unwrap_or_else(|| Utc::now() - self.lookback);

    let events = match connector.get_events(project_id, since).await {
      Ok(events) => events,
      Err(err) => {
        warn!(
          connector = %connector.name(),
          project = project_id,
          error = %format!("{:#}", err),
          "event fetch failed"
        );
        return;
      }
    };

    let events: Vec<Event> = events.into_iter().filter(|e| e.created_at > since).collect();
    if let Some(newest) = events.iter().map(|e| e.created_at).max() {
      self.last_seen.insert(slot, newest);
    }

    for event in &events {
      report.events += 1;
      for action in plan_invalidations(project_id, event) {
        self.apply(connector, project_id, action, report).await;
      }
    }
  }

  async fn apply(
    &self,
    connector: &CachedConnector,
    project_id: &str,
    action: Invalidation,
    report: &mut PollReport,
  ) {
    match action {
      Invalidation::Prefix(prefix) => match connector.invalidate_pattern(&prefix) {
        Ok(count) => report.invalidated += count,
        Err(err) => warn!(
          connector = %connector.name(),
          prefix = %prefix,
          error = %format!("{:#}", err),
          "invalidation failed"
        ),
      },
      Invalidation::Refresh(key) => {
        match connector.invalidate(&key) {
          Ok(removed) => report.invalidated += usize::from(removed),
          Err(err) => {
            warn!(
              connector = %connector.name(),
              key = %key,
              error = %format!("{:#}", err),
              "invalidation failed"
            );
            return;
          }
        }

        match connector.force_refresh(&key).await {
          Ok(RefreshOutcome::Refreshed) => report.refreshed += 1,
          Ok(RefreshOutcome::Unsupported) => {
            debug!(connector = %connector.name(), key = %key, "refresh skipped, capability missing");
          }
          Err(err) if CacheError::is_unsupported(&err) => {}
          Err(err) => warn!(
            connector = %connector.name(),
            project = project_id,
            key = %key,
            error = %format!("{:#}", err),
            "event-driven refresh failed"
          ),
        }
      }
    }
  }
}

#[async_trait]
impl Cycle for EventPoller {
  fn name(&self) -> &'static str {
    "event-poller"
  }

  async fn run_cycle(&mut self) {
    let report = self.poll_once().await;
    if report.events == 0 {
      debug!("no new events");
      return;
    }
    info!(
      events = report.events,
      invalidated = report.invalidated,
      refreshed = report.refreshed,
      "event poll complete"
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CachePolicy;
  use crate::ci::testing::{self, MockConnector};
  use crate::ci::Platform;

  fn key(project_id: &str, branch: &str) -> CacheKey {
    CacheKey::LatestPipeline {
      project_id: project_id.to_string(),
      branch: branch.to_string(),
    }
  }

  fn setup(mock: MockConnector) -> (Arc<MockConnector>, CachedConnector, EventPoller) {
    let mock = Arc::new(mock);
    let registry = Arc::new(Registry::default());
    let connector = CachedConnector::new("gl", mock.clone(), CachePolicy::default());
    registry.register(connector.clone()).unwrap();
    (mock, connector, EventPoller::new(registry))
  }

  #[test]
  fn test_push_plan() {
    let event = testing::event("P1", "pushed to", "refs/heads/main");
    assert_eq!(
      plan_invalidations("P1", &event),
      vec![
        Invalidation::Refresh(key("P1", "main")),
        Invalidation::Prefix("GetBranches:P1:".to_string()),
      ]
    );
  }

  #[test]
  fn test_push_without_ref_only_drops_branch_lists() {
    let event = testing::event("P1", "PushEvent", "");
    assert_eq!(
      plan_invalidations("P1", &event),
      vec![Invalidation::Prefix("GetBranches:P1:".to_string())]
    );
  }

  #[test]
  fn test_event_types_are_case_insensitive() {
    for kind in ["PUSHED NEW", "pushevent", "Pushed To"] {
      let event = testing::event("P1", kind, "dev");
      assert_eq!(
        plan_invalidations("P1", &event)[0],
        Invalidation::Refresh(key("P1", "dev"))
      );
    }
  }

  #[test]
  fn test_merge_request_and_issue_plans() {
    for kind in ["opened", "Merged", "accepted", "closed", "PullRequestEvent"] {
      assert_eq!(
        plan_invalidations("P1", &testing::event("P1", kind, "")),
        vec![Invalidation::Refresh(CacheKey::MergeRequests {
          project_id: "P1".to_string()
        })]
      );
    }
    assert_eq!(
      plan_invalidations("P1", &testing::event("P1", "IssuesEvent", "")),
      vec![Invalidation::Refresh(CacheKey::Issues {
        project_id: "P1".to_string()
      })]
    );
  }

  #[test]
  fn test_workflow_run_plan_and_unknown_types() {
    assert_eq!(
      plan_invalidations("P1", &testing::event("P1", "WorkflowRunEvent", "main")),
      vec![Invalidation::Prefix("GetPipelines:P1:".to_string())]
    );
    assert!(plan_invalidations("P1", &testing::event("P1", "commented on", "")).is_empty());
  }

  #[tokio::test]
  async fn test_push_refreshes_only_its_scope() {
    let (mock, connector, mut poller) = setup(
      MockConnector::new(Platform::Gitlab)
        .with_projects(vec![testing::project("P1")])
        .with_events(vec![testing::event("P1", "pushed to", "refs/heads/main")]),
    );
    connector.get_latest_pipeline("P1", "main").await.unwrap();
    connector.get_latest_pipeline("P1", "dev").await.unwrap();
    connector.get_branches("P1", 20).await.unwrap();
    connector.get_branch("P1", "main").await.unwrap();
    connector.get_pipelines("P1", 10).await.unwrap();

    let report = poller.poll_once().await;

    assert_eq!(report.events, 1);
    assert_eq!(report.invalidated, 2);
    assert_eq!(report.refreshed, 1);
    assert_eq!(mock.calls("get_latest_pipeline"), 3);
    assert!(connector.entry(&key("P1", "main")).unwrap().is_some());
    assert!(connector.entry(&key("P1", "dev")).unwrap().is_some());
    assert!(connector
      .entry(&CacheKey::Branches {
        project_id: "P1".to_string(),
        limit: 20
      })
      .unwrap()
      .is_none());
    assert!(connector
      .entry(&CacheKey::Branch {
        project_id: "P1".to_string(),
        branch: "main".to_string()
      })
      .unwrap()
      .is_some());
    assert!(connector
      .entry(&CacheKey::Pipelines {
        project_id: "P1".to_string(),
        limit: 10
      })
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_workflow_run_drops_pipeline_lists_without_refresh() {
    let (mock, connector, mut poller) = setup(
      MockConnector::new(Platform::Gitlab)
        .with_projects(vec![testing::project("P1")])
        .with_events(vec![testing::event("P1", "WorkflowRunEvent", "main")]),
    );
    connector.get_pipelines("P1", 10).await.unwrap();
    connector.get_pipelines("P1", 50).await.unwrap();

    let report = poller.poll_once().await;

    assert_eq!(report.invalidated, 2);
    assert_eq!(report.refreshed, 0);
    assert_eq!(mock.calls("get_pipelines"), 2);
    assert_eq!(connector.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_uncached_key_is_refreshed_but_not_counted_as_invalidated() {
    let (mock, connector, mut poller) = setup(
      MockConnector::new(Platform::Gitlab)
        .with_extended()
        .with_projects(vec![testing::project("P1")])
        .with_events(vec![testing::event("P1", "merged", "")]),
    );

    let report = poller.poll_once().await;

    assert_eq!(report.invalidated, 0);
    assert_eq!(report.refreshed, 1);
    assert_eq!(mock.calls("get_merge_requests"), 1);
    assert!(connector
      .entry(&CacheKey::MergeRequests {
        project_id: "P1".to_string()
      })
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_start_polls_until_stopped() {
    let (mock, _, poller) = setup(
      MockConnector::new(Platform::Gitlab)
        .with_projects(vec![testing::project("P1")])
        .with_events(vec![testing::event("P1", "opened", "")]),
    );

    let task = poller.start(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let poller = task.stop().await.unwrap();

    assert_eq!(mock.calls("get_events"), 1);
    assert!(poller.last_seen("gl", "P1").is_some());
  }

  #[tokio::test]
  async fn test_last_seen_advances() {
    let (mock, _, mut poller) = setup(
      MockConnector::new(Platform::Gitlab)
        .with_projects(vec![testing::project("P1")])
        .with_events(vec![testing::event("P1", "opened", "")]),
    );

    let first = poller.poll_once().await;
    let seen = poller.last_seen("gl", "P1").unwrap();
    let second = poller.poll_once().await;

    assert_eq!(first.events, 1);
    assert_eq!(second.events, 0);
    assert_eq!(poller.last_seen("gl", "P1"), Some(seen));

    let mut later = testing::event("P1", "closed", "");
    later.created_at = seen + ChronoDuration::seconds(1);
    mock.push_event(later);
    assert_eq!(poller.poll_once().await.events, 1);
    assert!(poller.last_seen("gl", "P1").unwrap() > seen);
  }

  #[tokio::test]
  async fn test_connectors_without_events_are_skipped() {
    let (mock, _, mut poller) = setup(
      MockConnector::new(Platform::Gitlab).with_projects(vec![testing::project("P1")]),
    );

    assert_eq!(poller.poll_once().await, PollReport::default());
    assert_eq!(mock.total_calls(), 0);
  }
}
