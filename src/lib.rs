//! Stale-while-revalidate caching and refresh orchestration for CI telemetry.
//!
//! Connectors for each CI platform are wrapped in a [`ci::CachedConnector`]
//! and registered with a [`registry::Registry`]. Two background loops keep
//! the caches warm: the [`refresher::ExpirationRefresher`] re-fetches expired
//! entries and persists a snapshot, and the [`event_poller::EventPoller`]
//! invalidates entries touched by upstream activity.

pub mod cache;
pub mod ci;
pub mod config;
pub mod error;
pub mod event_poller;
pub mod periodic;
pub mod refresher;
pub mod registry;

pub use error::CacheError;
