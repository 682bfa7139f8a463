//! Entry table with fresh/stale/expired bookkeeping and per-key flight locks.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex as FlightLock;

/// TTLs applied to every entry of one cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
  /// How long an entry is served without any upstream call
  pub fresh_ttl: Duration,
  /// How long an entry may be served at all (measured from fetch time)
  pub stale_ttl: Duration,
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self {
      fresh_ttl: Duration::minutes(1),
      stale_ttl: Duration::hours(1),
    }
  }
}

impl CachePolicy {
  pub fn new(fresh_ttl: Duration, stale_ttl: Duration) -> Self {
    Self {
      fresh_ttl,
      stale_ttl,
    }
  }
}

/// Lifecycle zone of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  Fresh,
  Stale,
  Expired,
}

/// A cached value and its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub value: V,
  pub fetched_at: DateTime<Utc>,
  pub fresh_until: DateTime<Utc>,
  pub stale_until: DateTime<Utc>,
  /// Last upstream failure since the value was stored
  pub last_error: Option<String>,
  /// A background refresh has been scheduled and has not finished yet
  pub refreshing: bool,
}

impl<V> CacheEntry<V> {
  fn new(value: V, fetched_at: DateTime<Utc>, policy: &CachePolicy) -> Self {
    let fresh_until = fetched_at + policy.fresh_ttl;
    Self {
      value,
      fetched_at,
      fresh_until,
      stale_until: (fetched_at + policy.stale_ttl).max(fresh_until),
      last_error: None,
      refreshing: false,
    }
  }

  pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
    if now < self.fresh_until {
      Freshness::Fresh
    } else if now < self.stale_until {
      Freshness::Stale
    } else {
      Freshness::Expired
    }
  }
}

/// Outcome of looking a key up.
#[derive(Debug, Clone)]
pub enum Lookup<V> {
  Fresh {
    value: V,
    fetched_at: DateTime<Utc>,
  },
  /// `schedule_refresh` is true for exactly one caller per stale period
  Stale {
    value: V,
    fetched_at: DateTime<Utc>,
    schedule_refresh: bool,
  },
  /// Past the stale TTL; the value is only usable as a fallback
  Expired {
    value: V,
    fetched_at: DateTime<Utc>,
  },
  Missing,
}

type Entries<K, V> = HashMap<K, CacheEntry<V>>;

/// Cache layer holding one connector's entries.
///
/// Entries are guarded by a reader/writer lock. Fetches for a key are
/// serialized through that key's flight lock, which the caller holds for the
/// duration of the upstream call.
pub struct CacheLayer<K, V> {
  entries: Arc<RwLock<Entries<K, V>>>,
  flights: Arc<Mutex<HashMap<K, Arc<FlightLock<()>>>>>,
  policy: CachePolicy,
}

impl<K, V> CacheLayer<K, V>
where
  K: Eq + Hash + Clone + Display,
  V: Clone,
{
  pub fn new(policy: CachePolicy) -> Self {
    Self {
      entries: Arc::new(RwLock::new(HashMap::new())),
      flights: Arc::new(Mutex::new(HashMap::new())),
      policy,
    }
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  fn read(&self) -> Result<RwLockReadGuard<'_, Entries<K, V>>> {
    self
      .entries
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn write(&self) -> Result<RwLockWriteGuard<'_, Entries<K, V>>> {
    self
      .entries
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Look a key up. A stale hit claims the background refresh for the caller
  /// when none is in flight yet.
  pub fn lookup(&self, key: &K) -> Result<Lookup<V>> {
    let now = Utc::now();

    {
      let entries = self.read()?;
      let Some(entry) = entries.get(key) else {
        return Ok(Lookup::Missing);
      };
      match entry.freshness(now) {
        Freshness::Fresh => {
          return Ok(Lookup::Fresh {
            value: entry.value.clone(),
            fetched_at: entry.fetched_at,
          })
        }
        Freshness::Expired => {
          return Ok(Lookup::Expired {
            value: entry.value.clone(),
            fetched_at: entry.fetched_at,
          })
        }
        Freshness::Stale if entry.refreshing => {
          return Ok(Lookup::Stale {
            value: entry.value.clone(),
            fetched_at: entry.fetched_at,
            schedule_refresh: false,
          })
        }
        Freshness::Stale => {}
      }
    }

    // Stale with nothing in flight: re-check and claim under the write lock
    let mut entries = self.write()?;
    let Some(entry) = entries.get_mut(key) else {
      return Ok(Lookup::Missing);
    };
    let lookup = match entry.freshness(now) {
      Freshness::Fresh => Lookup::Fresh {
        value: entry.value.clone(),
        fetched_at: entry.fetched_at,
      },
      Freshness::Expired => Lookup::Expired {
        value: entry.value.clone(),
        fetched_at: entry.fetched_at,
      },
      Freshness::Stale => {
        let schedule_refresh = !entry.refreshing;
        entry.refreshing = true;
        Lookup::Stale {
          value: entry.value.clone(),
          fetched_at: entry.fetched_at,
          schedule_refresh,
        }
      }
    };
    Ok(lookup)
  }

  /// Copy of an entry, without touching its refresh flag.
  pub fn entry(&self, key: &K) -> Result<Option<CacheEntry<V>>> {
    Ok(self.read()?.get(key).cloned())
  }

  /// Store a freshly fetched value, replacing any previous entry.
  pub fn store(&self, key: K, value: V) -> Result<()> {
    let entry = CacheEntry::new(value, Utc::now(), &self.policy);
    self.write()?.insert(key, entry);
    Ok(())
  }

  /// Record an upstream failure on an existing entry and release its refresh
  /// claim. The cached value is kept.
  pub fn record_error(&self, key: &K, error: String) -> Result<()> {
    if let Some(entry) = self.write()?.get_mut(key) {
      entry.last_error = Some(error);
      entry.refreshing = false;
    }
    Ok(())
  }

  /// Claim the refresh of an existing entry. False when the key is missing or
  /// a refresh is already in flight.
  pub fn claim(&self, key: &K) -> Result<bool> {
    let mut entries = self.write()?;
    let Some(entry) = entries.get_mut(key) else {
      return Ok(false);
    };
    if entry.refreshing {
      return Ok(false);
    }
    entry.refreshing = true;
    Ok(true)
  }

  /// Release a refresh claim without storing anything.
  pub fn release(&self, key: &K) -> Result<()> {
    if let Some(entry) = self.write()?.get_mut(key) {
      entry.refreshing = false;
    }
    Ok(())
  }

  /// Keys past their fresh TTL with no refresh in flight, in no particular order.
  pub fn expired_keys(&self) -> Result<Vec<K>> {
    let now = Utc::now();
    let keys = self
      .read()?
      .iter()
      .filter(|(_, entry)| !entry.refreshing && entry.freshness(now) != Freshness::Fresh)
      .map(|(key, _)| key.clone())
      .collect();
    Ok(keys)
  }

  pub fn invalidate(&self, key: &K) -> Result<bool> {
    let removed = self.write()?.remove(key).is_some();
    self.forget_flight(key)?;
    Ok(removed)
  }

  /// Drop every entry whose rendered key starts with `prefix`.
  pub fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
    let removed: Vec<K> = {
      let mut entries = self.write()?;
      let removed: Vec<K> = entries
        .keys()
        .filter(|key| key.to_string().starts_with(prefix))
        .cloned()
        .collect();
      for key in &removed {
        entries.remove(key);
      }
      removed
    };
    for key in &removed {
      self.forget_flight(key)?;
    }
    Ok(removed.len())
  }

  /// Seed entries without an upstream call. Existing entries are overwritten.
  pub fn populate(&self, items: impl IntoIterator<Item = (K, V)>) -> Result<usize> {
    let now = Utc::now();
    let mut entries = self.write()?;
    let mut count = 0;
    for (key, value) in items {
      entries.insert(key, CacheEntry::new(value, now, &self.policy));
      count += 1;
    }
    Ok(count)
  }

  /// All cached values, for export.
  pub fn values(&self) -> Result<Vec<(K, V)>> {
    let values = self
      .read()?
      .iter()
      .map(|(key, entry)| (key.clone(), entry.value.clone()))
      .collect();
    Ok(values)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.read()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.read()?.is_empty())
  }

  /// Flight lock for a key. Hold the guard across the upstream call.
  pub fn flight(&self, key: &K) -> Result<Arc<FlightLock<()>>> {
    let mut flights = self
      .flights
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(Arc::clone(flights.entry(key.clone()).or_default()))
  }

  #[cfg(test)]
  fn flight_count(&self) -> usize {
    self.flights.lock().map(|flights| flights.len()).unwrap_or(0)
  }

  fn forget_flight(&self, key: &K) -> Result<()> {
    let mut flights = self
      .flights
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    // Only drop locks nobody holds, otherwise a new caller could race the
    // fetch currently in flight
    if flights.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
      flights.remove(key);
    }
    Ok(())
  }
}

impl<K, V> Clone for CacheLayer<K, V> {
  fn clone(&self) -> Self {
    Self {
      entries: Arc::clone(&self.entries),
      flights: Arc::clone(&self.flights),
      policy: self.policy,
    }
  }
}
