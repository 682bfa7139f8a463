use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// CI platform a connector talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
  Gitlab,
  Github,
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Platform::Gitlab => f.write_str("gitlab"),
      Platform::Github => f.write_str("github"),
    }
  }
}

/// Project (GitLab project or GitHub repository)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
  pub id: String,
  pub platform: Platform,
  pub name: String,
  /// Namespaced path, e.g. "group/app" or "org/repo"
  pub path: String,
  pub web_url: String,
  pub default_branch: String,
  pub last_activity: Option<DateTime<Utc>>,
  /// Registered connector this record was fetched through
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub connector: String,
}

/// Pipeline (GitLab pipeline or GitHub workflow run)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
  pub id: String,
  pub platform: Platform,
  pub project_id: String,
  #[serde(rename = "ref")]
  pub git_ref: String,
  pub status: String,
  pub sha: String,
  pub web_url: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub connector: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
  pub name: String,
  pub platform: Platform,
  pub project_id: String,
  pub commit_sha: String,
  pub last_commit_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub is_default: bool,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub connector: String,
}

/// Merge request (GitLab) or pull request (GitHub)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
  pub id: String,
  pub platform: Platform,
  pub project_id: String,
  pub title: String,
  pub state: String,
  pub source_branch: String,
  pub target_branch: String,
  pub author: String,
  pub web_url: String,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub connector: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
  pub id: String,
  pub platform: Platform,
  pub project_id: String,
  pub title: String,
  pub state: String,
  pub author: String,
  #[serde(default)]
  pub labels: Vec<String>,
  pub web_url: String,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub connector: String,
}

/// The authenticated user of a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
  pub id: String,
  pub platform: Platform,
  pub username: String,
  pub name: String,
  pub avatar_url: Option<String>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub connector: String,
}

/// Upstream activity record, consumed by the event poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub id: String,
  pub platform: Platform,
  pub project_id: String,
  /// Platform-specific type tag ("pushed to", "PushEvent", "opened", ...)
  #[serde(rename = "type")]
  pub kind: String,
  /// Branch or ref the event targets, e.g. "refs/heads/main"
  #[serde(default)]
  pub target_ref: String,
  pub created_at: DateTime<Utc>,
}
