//! Typed error conditions callers branch on.
//!
//! Everything else travels as an opaque `color_eyre::Report`; these variants
//! are wrapped in a report too and recovered with `downcast_ref`.

use std::path::PathBuf;
use thiserror::Error;

use crate::ci::Capability;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("connector '{0}' is already registered")]
  AlreadyRegistered(String),

  #[error("malformed cache key '{0}'")]
  MalformedKey(String),

  #[error("connector '{connector}' does not support {capability}")]
  Unsupported {
    connector: String,
    capability: Capability,
  },

  #[error("snapshot at {} is corrupt: {source}", path.display())]
  CorruptSnapshot {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("cached value for {key} is not {expected}")]
  TypeMismatch { key: String, expected: &'static str },
}

impl CacheError {
  /// Whether a report carries an unsupported-capability error.
  pub fn is_unsupported(report: &color_eyre::Report) -> bool {
    matches!(
      report.downcast_ref::<CacheError>(),
      Some(CacheError::Unsupported { .. })
    )
  }
}
