//! Instrumented in-memory connector and fixtures shared by the tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::connector::{Connector, EventConnector, ExtendedConnector, UserConnector};
use super::types::{Branch, Event, Issue, MergeRequest, Pipeline, Platform, Project, UserProfile};

pub fn project(id: &str) -> Project {
  Project {
    id: id.to_string(),
    platform: Platform::Gitlab,
    name: format!("project-{}", id),
    path: format!("group/project-{}", id),
    web_url: format!("https://gitlab.example.com/group/project-{}", id),
    default_branch: "main".to_string(),
    last_activity: None,
    connector: String::new(),
  }
}

pub fn pipeline(project_id: &str, git_ref: &str, id: u64) -> Pipeline {
  let created_at = DateTime::<Utc>::default() + ChronoDuration::seconds(id as i64);
  Pipeline {
    id: id.to_string(),
    platform: Platform::Gitlab,
    project_id: project_id.to_string(),
    git_ref: git_ref.to_string(),
    status: "success".to_string(),
    sha: format!("{:040x}", id),
    web_url: format!("https://gitlab.example.com/pipelines/{}", id),
    created_at,
    updated_at: created_at,
    connector: String::new(),
  }
}

pub fn branch(project_id: &str, name: &str) -> Branch {
  Branch {
    name: name.to_string(),
    platform: Platform::Gitlab,
    project_id: project_id.to_string(),
    commit_sha: "abc123".to_string(),
    last_commit_at: None,
    is_default: name == "main",
    connector: String::new(),
  }
}

pub fn merge_request(project_id: &str, id: &str) -> MergeRequest {
  MergeRequest {
    id: id.to_string(),
    platform: Platform::Gitlab,
    project_id: project_id.to_string(),
    title: format!("Change {}", id),
    state: "opened".to_string(),
    source_branch: "feature".to_string(),
    target_branch: "main".to_string(),
    author: "alice".to_string(),
    web_url: format!("https://gitlab.example.com/mr/{}", id),
    updated_at: Utc::now(),
    connector: String::new(),
  }
}

pub fn issue(project_id: &str, id: &str) -> Issue {
  Issue {
    id: id.to_string(),
    platform: Platform::Gitlab,
    project_id: project_id.to_string(),
    title: format!("Bug {}", id),
    state: "opened".to_string(),
    author: "bob".to_string(),
    labels: vec!["bug".to_string()],
    web_url: format!("https://gitlab.example.com/issues/{}", id),
    updated_at: Utc::now(),
    connector: String::new(),
  }
}

pub fn user() -> UserProfile {
  UserProfile {
    id: "7".to_string(),
    platform: Platform::Gitlab,
    username: "alice".to_string(),
    name: "Alice".to_string(),
    avatar_url: None,
    connector: String::new(),
  }
}

pub fn event(project_id: &str, kind: &str, target_ref: &str) -> Event {
  Event {
    id: format!("{}-{}", project_id, kind),
    platform: Platform::Gitlab,
    project_id: project_id.to_string(),
    kind: kind.to_string(),
    target_ref: target_ref.to_string(),
    created_at: Utc::now(),
  }
}

/// Connector backed by fixtures that counts calls and concurrency.
pub struct MockConnector {
  platform: Platform,
  projects: Vec<Project>,
  events: Mutex<Vec<Event>>,
  latency: Duration,
  extended: bool,
  user: bool,
  with_events: bool,
  failing: AtomicBool,
  calls: Mutex<HashMap<&'static str, usize>>,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

impl MockConnector {
  pub fn new(platform: Platform) -> Self {
    Self {
      platform,
      projects: Vec::new(),
      events: Mutex::new(Vec::new()),
      latency: Duration::ZERO,
      extended: false,
      user: false,
      with_events: false,
      failing: AtomicBool::new(false),
      calls: Mutex::new(HashMap::new()),
      in_flight: AtomicUsize::new(0),
      max_in_flight: AtomicUsize::new(0),
    }
  }

  pub fn with_projects(mut self, projects: Vec<Project>) -> Self {
    self.projects = projects;
    self
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn with_extended(mut self) -> Self {
    self.extended = true;
    self
  }

  pub fn with_user(mut self) -> Self {
    self.user = true;
    self
  }

  pub fn with_events(mut self, events: Vec<Event>) -> Self {
    self.with_events = true;
    self.events = Mutex::new(events);
    self
  }

  pub fn push_event(&self, event: Event) {
    self.events.lock().unwrap().push(event);
  }

  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  pub fn calls(&self, method: &str) -> usize {
    self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().values().sum()
  }

  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  async fn track<T>(&self, method: &'static str, produce: impl FnOnce(usize) -> T) -> Result<T> {
    let call = {
      let mut calls = self.calls.lock().unwrap();
      let count = calls.entry(method).or_insert(0);
      *count += 1;
      *count
    };

    let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(current, Ordering::SeqCst);
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    if self.failing.load(Ordering::SeqCst) {
      return Err(eyre!("{} failed: 503 Service Unavailable", method));
    }
    Ok(produce(call))
  }
}

#[async_trait]
impl Connector for MockConnector {
  fn platform(&self) -> Platform {
    self.platform
  }

  async fn get_projects(&self) -> Result<Vec<Project>> {
    self.track("get_projects", |_| self.projects.clone()).await
  }

  async fn get_project_count(&self) -> Result<usize> {
    self.track("get_project_count", |_| self.projects.len()).await
  }

  async fn get_latest_pipeline(&self, project_id: &str, branch: &str) -> Result<Pipeline> {
    self
      .track("get_latest_pipeline", |call| {
        pipeline(project_id, branch, 1000 + call as u64)
      })
      .await
  }

  async fn get_pipelines(&self, project_id: &str, limit: usize) -> Result<Vec<Pipeline>> {
    self
      .track("get_pipelines", |call| {
        (0..limit.min(3))
          .map(|i| pipeline(project_id, "main", (call * 10 + i) as u64))
          .collect()
      })
      .await
  }

  async fn get_branches(&self, project_id: &str, limit: usize) -> Result<Vec<Branch>> {
    self
      .track("get_branches", |_| {
        vec![branch(project_id, "main"), branch(project_id, "dev")]
          .into_iter()
          .take(limit)
          .collect()
      })
      .await
  }

  async fn get_branch(&self, project_id: &str, name: &str) -> Result<Branch> {
    self
      .track("get_branch", |_| branch(project_id, name))
      .await
  }

  fn as_extended(&self) -> Option<&dyn ExtendedConnector> {
    if self.extended {
      Some(self)
    } else {
      None
    }
  }

  fn as_user(&self) -> Option<&dyn UserConnector> {
    if self.user {
      Some(self)
    } else {
      None
    }
  }

  fn as_events(&self) -> Option<&dyn EventConnector> {
    if self.with_events {
      Some(self)
    } else {
      None
    }
  }
}

#[async_trait]
impl ExtendedConnector for MockConnector {
  async fn get_merge_requests(&self, project_id: &str) -> Result<Vec<MergeRequest>> {
    self
      .track("get_merge_requests", |call| {
        vec![merge_request(project_id, &call.to_string())]
      })
      .await
  }

  async fn get_issues(&self, project_id: &str) -> Result<Vec<Issue>> {
    self
      .track("get_issues", |call| vec![issue(project_id, &call.to_string())])
      .await
  }
}

#[async_trait]
impl UserConnector for MockConnector {
  async fn get_current_user(&self) -> Result<UserProfile> {
    self.track("get_current_user", |_| user()).await
  }
}

#[async_trait]
impl EventConnector for MockConnector {
  async fn get_events(&self, project_id: &str, since: DateTime<Utc>) -> Result<Vec<Event>> {
    let events: Vec<Event> = self
      .events
      .lock()
      .unwrap()
      .iter()
      .filter(|e| e.project_id == project_id && e.created_at > since)
      .cloned()
      .collect();
    self.track("get_events", |_| events).await
  }
}
