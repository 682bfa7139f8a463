//! Cache keys and cached value types for CI connectors.

use std::fmt;
use std::str::FromStr;

use crate::cache::Cacheable;
use crate::error::CacheError;

use super::connector::Capability;
use super::types::{Branch, Issue, MergeRequest, Pipeline, Project, UserProfile};

// ============================================================================
// Cache keys
// ============================================================================

/// One cached connector call: the method plus its arguments in declared order.
///
/// Rendered as `Method` or `Method:arg1:arg2` for logging and prefix
/// matching. Colons inside arguments are not escaped; on parse the last
/// argument keeps any remaining colons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
  Projects,
  ProjectCount,
  LatestPipeline { project_id: String, branch: String },
  Pipelines { project_id: String, limit: usize },
  Branches { project_id: String, limit: usize },
  Branch { project_id: String, branch: String },
  MergeRequests { project_id: String },
  Issues { project_id: String },
  CurrentUser,
}

impl CacheKey {
  pub const GET_PROJECTS: &'static str = "GetProjects";
  pub const GET_PROJECT_COUNT: &'static str = "GetProjectCount";
  pub const GET_LATEST_PIPELINE: &'static str = "GetLatestPipeline";
  pub const GET_PIPELINES: &'static str = "GetPipelines";
  pub const GET_BRANCHES: &'static str = "GetBranches";
  pub const GET_BRANCH: &'static str = "GetBranch";
  pub const GET_MERGE_REQUESTS: &'static str = "GetMergeRequests";
  pub const GET_ISSUES: &'static str = "GetIssues";
  pub const GET_CURRENT_USER: &'static str = "GetCurrentUser";

  pub fn method(&self) -> &'static str {
    match self {
      Self::Projects => Self::GET_PROJECTS,
      Self::ProjectCount => Self::GET_PROJECT_COUNT,
      Self::LatestPipeline { .. } => Self::GET_LATEST_PIPELINE,
      Self::Pipelines { .. } => Self::GET_PIPELINES,
      Self::Branches { .. } => Self::GET_BRANCHES,
      Self::Branch { .. } => Self::GET_BRANCH,
      Self::MergeRequests { .. } => Self::GET_MERGE_REQUESTS,
      Self::Issues { .. } => Self::GET_ISSUES,
      Self::CurrentUser => Self::GET_CURRENT_USER,
    }
  }

  /// Project the key is scoped to, if any.
  pub fn project_id(&self) -> Option<&str> {
    match self {
      Self::Projects | Self::ProjectCount | Self::CurrentUser => None,
      Self::LatestPipeline { project_id, .. }
      | Self::Pipelines { project_id, .. }
      | Self::Branches { project_id, .. }
      | Self::Branch { project_id, .. }
      | Self::MergeRequests { project_id }
      | Self::Issues { project_id } => Some(project_id),
    }
  }

  /// Optional capability the key's method needs.
  pub fn capability(&self) -> Option<Capability> {
    match self {
      Self::MergeRequests { .. } => Some(Capability::MergeRequests),
      Self::Issues { .. } => Some(Capability::Issues),
      Self::CurrentUser => Some(Capability::CurrentUser),
      _ => None,
    }
  }

  /// Prefix matching every `GetPipelines` key of a project, whatever the limit.
  pub fn pipelines_prefix(project_id: &str) -> String {
    format!("{}:{}:", Self::GET_PIPELINES, project_id)
  }

  /// Prefix matching every `GetBranches` key of a project, whatever the limit.
  pub fn branches_prefix(project_id: &str) -> String {
    format!("{}:{}:", Self::GET_BRANCHES, project_id)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let method = self.method();
    match self {
      Self::Projects | Self::ProjectCount | Self::CurrentUser => f.write_str(method),
      Self::LatestPipeline { project_id, branch } | Self::Branch { project_id, branch } => {
        write!(f, "{}:{}:{}", method, project_id, branch)
      }
      Self::Pipelines { project_id, limit } | Self::Branches { project_id, limit } => {
        write!(f, "{}:{}:{}", method, project_id, limit)
      }
      Self::MergeRequests { project_id } | Self::Issues { project_id } => {
        write!(f, "{}:{}", method, project_id)
      }
    }
  }
}

impl FromStr for CacheKey {
  type Err = CacheError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let malformed = || CacheError::MalformedKey(s.to_string());
    let (method, rest) = match s.split_once(':') {
      Some((method, rest)) => (method, Some(rest)),
      None => (s, None),
    };

    // Split "project:arg", the trailing argument keeps any further colons
    let pair = |rest: Option<&str>| -> Result<(String, String), CacheError> {
      let (project_id, arg) = rest.and_then(|r| r.split_once(':')).ok_or_else(malformed)?;
      if project_id.is_empty() || arg.is_empty() {
        return Err(malformed());
      }
      Ok((project_id.to_string(), arg.to_string()))
    };
    let single = |rest: Option<&str>| -> Result<String, CacheError> {
      match rest {
        Some(project_id) if !project_id.is_empty() => Ok(project_id.to_string()),
        _ => Err(malformed()),
      }
    };
    let limit = |arg: String| arg.parse::<usize>().map_err(|_| malformed());

    let key = match method {
      Self::GET_PROJECTS if rest.is_none() => Self::Projects,
      Self::GET_PROJECT_COUNT if rest.is_none() => Self::ProjectCount,
      Self::GET_CURRENT_USER if rest.is_none() => Self::CurrentUser,
      Self::GET_LATEST_PIPELINE => {
        let (project_id, branch) = pair(rest)?;
        Self::LatestPipeline { project_id, branch }
      }
      Self::GET_BRANCH => {
        let (project_id, branch) = pair(rest)?;
        Self::Branch { project_id, branch }
      }
      Self::GET_PIPELINES => {
        let (project_id, arg) = pair(rest)?;
        Self::Pipelines {
          project_id,
          limit: limit(arg)?,
        }
      }
      Self::GET_BRANCHES => {
        let (project_id, arg) = pair(rest)?;
        Self::Branches {
          project_id,
          limit: limit(arg)?,
        }
      }
      Self::GET_MERGE_REQUESTS => Self::MergeRequests {
        project_id: single(rest)?,
      },
      Self::GET_ISSUES => Self::Issues {
        project_id: single(rest)?,
      },
      _ => return Err(malformed()),
    };
    Ok(key)
  }
}

// ============================================================================
// Cached values
// ============================================================================

/// Value stored for a cache key; one variant per connector return type.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
  Projects(Vec<Project>),
  ProjectCount(usize),
  Pipeline(Pipeline),
  Pipelines(Vec<Pipeline>),
  Branches(Vec<Branch>),
  Branch(Branch),
  MergeRequests(Vec<MergeRequest>),
  Issues(Vec<Issue>),
  User(UserProfile),
}

macro_rules! impl_cacheable {
  ($ty:ty, $variant:ident, $kind:literal) => {
    impl Cacheable<CachedValue> for $ty {
      fn kind() -> &'static str {
        $kind
      }

      fn into_cached(self) -> CachedValue {
        CachedValue::$variant(self)
      }

      fn from_cached(value: CachedValue) -> Option<Self> {
        match value {
          CachedValue::$variant(inner) => Some(inner),
          _ => None,
        }
      }
    }
  };
}

impl_cacheable!(Vec<Project>, Projects, "a project list");
impl_cacheable!(usize, ProjectCount, "a project count");
impl_cacheable!(Pipeline, Pipeline, "a pipeline");
impl_cacheable!(Vec<Pipeline>, Pipelines, "a pipeline list");
impl_cacheable!(Vec<Branch>, Branches, "a branch list");
impl_cacheable!(Branch, Branch, "a branch");
impl_cacheable!(Vec<MergeRequest>, MergeRequests, "a merge request list");
impl_cacheable!(Vec<Issue>, Issues, "an issue list");
impl_cacheable!(UserProfile, User, "a user profile");
