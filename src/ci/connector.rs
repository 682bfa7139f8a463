//! Capability sets implemented by platform connectors.
//!
//! A connector always implements [`Connector`]. The optional sets are exposed
//! through the `as_*` accessors, which default to `None`; [`Capabilities`]
//! probes them once when a connector is wrapped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::fmt;

use super::types::{Branch, Event, Issue, MergeRequest, Pipeline, Platform, Project, UserProfile};

/// Base capability set every connector provides.
#[async_trait]
pub trait Connector: Send + Sync {
  fn platform(&self) -> Platform;

  async fn get_projects(&self) -> Result<Vec<Project>>;

  async fn get_project_count(&self) -> Result<usize>;

  /// Most recent pipeline on a branch
  async fn get_latest_pipeline(&self, project_id: &str, branch: &str) -> Result<Pipeline>;

  /// Most recent pipelines of a project, newest first
  async fn get_pipelines(&self, project_id: &str, limit: usize) -> Result<Vec<Pipeline>>;

  async fn get_branches(&self, project_id: &str, limit: usize) -> Result<Vec<Branch>>;

  async fn get_branch(&self, project_id: &str, branch: &str) -> Result<Branch>;

  /// Merge request and issue support, if any.
  fn as_extended(&self) -> Option<&dyn ExtendedConnector> {
    None
  }

  /// Current-user support, if any.
  fn as_user(&self) -> Option<&dyn UserConnector> {
    None
  }

  /// Activity-event support, if any.
  fn as_events(&self) -> Option<&dyn EventConnector> {
    None
  }
}

#[async_trait]
pub trait ExtendedConnector: Send + Sync {
  async fn get_merge_requests(&self, project_id: &str) -> Result<Vec<MergeRequest>>;

  async fn get_issues(&self, project_id: &str) -> Result<Vec<Issue>>;
}

#[async_trait]
pub trait UserConnector: Send + Sync {
  async fn get_current_user(&self) -> Result<UserProfile>;
}

#[async_trait]
pub trait EventConnector: Send + Sync {
  /// Events for a project created after `since`, in any order.
  async fn get_events(&self, project_id: &str, since: DateTime<Utc>) -> Result<Vec<Event>>;
}

/// Optional capability a connector may lack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
  MergeRequests,
  Issues,
  CurrentUser,
  Events,
}

impl fmt::Display for Capability {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Capability::MergeRequests => f.write_str("merge requests"),
      Capability::Issues => f.write_str("issues"),
      Capability::CurrentUser => f.write_str("current user"),
      Capability::Events => f.write_str("events"),
    }
  }
}

/// Optional capabilities resolved once per connector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
  pub merge_requests: bool,
  pub issues: bool,
  pub current_user: bool,
  pub events: bool,
}

impl Capabilities {
  pub fn probe(connector: &dyn Connector) -> Self {
    let extended = connector.as_extended().is_some();
    Self {
      merge_requests: extended,
      issues: extended,
      current_user: connector.as_user().is_some(),
      events: connector.as_events().is_some(),
    }
  }

  pub fn supports(&self, capability: Capability) -> bool {
    match capability {
      Capability::MergeRequests => self.merge_requests,
      Capability::Issues => self.issues,
      Capability::CurrentUser => self.current_user,
      Capability::Events => self.events,
    }
  }
}
