//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Trait for typed results that live inside a cache value enum `V`.
///
/// Each cached method returns one concrete type; implementors convert it into
/// the shared value representation and back.
pub trait Cacheable<V>: Sized + Send {
  /// Type name used in mismatch errors (e.g., "project list")
  fn kind() -> &'static str;

  fn into_cached(self) -> V;

  /// Returns None if the value holds a different type.
  fn from_cached(value: V) -> Option<Self>;
}

/// Data persisted by the file cache, stamped on every save.
pub trait Timestamped: Serialize + DeserializeOwned {
  fn stamp(&mut self, at: DateTime<Utc>);

  fn timestamp(&self) -> DateTime<Utc>;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched upstream
  pub fetched_at: DateTime<Utc>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from data that was just fetched.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at: Utc::now(),
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, fetched_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      fetched_at,
    }
  }

  /// Create a new cache result served because the upstream fetch failed.
  pub fn fallback(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      fetched_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched synchronously for this call
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its fresh TTL; a background refresh is in flight
  CacheStale,
  /// Upstream fetch failed, serving the last known value
  Fallback,
}
