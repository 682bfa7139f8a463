//! Flattened, persisted copy of every cached entity collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Timestamped;

use super::types::{Branch, Issue, MergeRequest, Pipeline, Project, UserProfile};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub projects: Vec<Project>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub pipelines: Vec<Pipeline>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub branches: Vec<Branch>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub merge_requests: Vec<MergeRequest>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub issues: Vec<Issue>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub user_profiles: Vec<UserProfile>,
}

impl Snapshot {
  /// Append another snapshot's collections.
  pub fn merge(&mut self, other: Snapshot) {
    self.projects.extend(other.projects);
    self.pipelines.extend(other.pipelines);
    self.branches.extend(other.branches);
    self.merge_requests.extend(other.merge_requests);
    self.issues.extend(other.issues);
    self.user_profiles.extend(other.user_profiles);
  }

  pub fn entity_count(&self) -> usize {
    self.projects.len()
      + self.pipelines.len()
      + self.branches.len()
      + self.merge_requests.len()
      + self.issues.len()
      + self.user_profiles.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entity_count() == 0
  }
}

impl Timestamped for Snapshot {
  fn stamp(&mut self, at: DateTime<Utc>) {
    self.timestamp = at;
  }

  fn timestamp(&self) -> DateTime<Utc> {
    self.timestamp
  }
}
