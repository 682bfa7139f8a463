//! Generic stale-while-revalidate caching layer.
//!
//! This module is platform-agnostic:
//! - Entries move through fresh, stale and expired zones driven by two TTLs
//! - Stale hits hand out a single refresh claim per key
//! - Per-key flight locks serialize upstream fetches
//! - Snapshots persist to one JSON file, replaced atomically

mod layer;
mod storage;
mod traits;

pub use layer::{CacheEntry, CacheLayer, CachePolicy, Freshness, Lookup};
pub use storage::FileCache;
pub use traits::{CacheResult, CacheSource, Cacheable, Timestamped};
