//! CI telemetry domain: entities, connector capability sets and the caching
//! decorator that wraps them.

pub mod cache;
pub mod cached_connector;
pub mod connector;
pub mod snapshot;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use cache::{CacheKey, CachedValue};
pub use cached_connector::{CachedConnector, RefreshOutcome, DEFAULT_POPULATE_LIMIT};
pub use connector::{
  Capabilities, Capability, Connector, EventConnector, ExtendedConnector, UserConnector,
};
pub use snapshot::Snapshot;
pub use types::{Branch, Event, Issue, MergeRequest, Pipeline, Platform, Project, UserProfile};
