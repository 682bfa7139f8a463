//! Single-file JSON snapshot storage for warm restarts.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::traits::Timestamped;
use crate::error::CacheError;

/// File-backed snapshot store.
///
/// Saves go to a temporary file beside the target and are renamed over it,
/// so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileCache {
  path: PathBuf,
}

impl FileCache {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Default snapshot location under the user's cache directory.
  pub fn default_path() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| eyre!("Could not determine cache directory"))?;

    Ok(cache_dir.join("ciwatch").join("snapshot.json"))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn temp_path(&self) -> PathBuf {
    let mut name = self
      .path
      .file_name()
      .map(|n| n.to_os_string())
      .unwrap_or_else(|| "snapshot".into());
    name.push(".tmp");
    self.path.with_file_name(name)
  }

  /// Load the snapshot. A missing file is `Ok(None)`; unparsable content is a
  /// `CacheError::CorruptSnapshot`.
  pub fn load<T: Timestamped>(&self) -> Result<Option<T>> {
    let contents = match fs::read_to_string(&self.path) {
      Ok(contents) => contents,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
      Err(e) => {
        return Err(eyre!(
          "Failed to read snapshot {}: {}",
          self.path.display(),
          e
        ))
      }
    };

    let data = serde_json::from_str(&contents).map_err(|source| CacheError::CorruptSnapshot {
      path: self.path.clone(),
      source,
    })?;

    Ok(Some(data))
  }

  /// Stamp the current time on `data` and atomically replace the snapshot.
  pub fn save<T: Timestamped>(&self, data: &mut T) -> Result<()> {
    data.stamp(Utc::now());

    let bytes =
      serde_json::to_vec_pretty(data).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;

    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create snapshot directory: {}", e))?;
    }

    let temp = self.temp_path();
    if let Err(e) = write_and_sync(&temp, &bytes).and_then(|_| fs::rename(&temp, &self.path)) {
      let _ = fs::remove_file(&temp);
      return Err(eyre!(
        "Failed to write snapshot {}: {}",
        self.path.display(),
        e
      ));
    }

    debug!(path = %self.path.display(), bytes = bytes.len(), "snapshot saved");
    Ok(())
  }

  /// Remove the snapshot. A missing file is not an error.
  pub fn clear(&self) -> Result<()> {
    match fs::remove_file(&self.path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(eyre!(
        "Failed to remove snapshot {}: {}",
        self.path.display(),
        e
      )),
    }
  }
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
  let mut file = File::create(path)?;
  file.write_all(bytes)?;
  file.sync_all()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{DateTime, Utc};
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
  struct Notes {
    timestamp: DateTime<Utc>,
    lines: Vec<String>,
  }

  impl Timestamped for Notes {
    fn stamp(&mut self, at: DateTime<Utc>) {
      self.timestamp = at;
    }

    fn timestamp(&self) -> DateTime<Utc> {
      self.timestamp
    }
  }

  #[test]
  fn test_load_missing_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::new(dir.path().join("snapshot.json"));

    let loaded: Option<Notes> = cache.load().unwrap();
    assert!(loaded.is_none());
  }

  #[test]
  fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::new(dir.path().join("nested").join("snapshot.json"));

    let mut notes = Notes {
      lines: vec!["one".to_string(), "two".to_string()],
      ..Default::default()
    };
    cache.save(&mut notes).unwrap();

    let loaded: Notes = cache.load().unwrap().unwrap();
    assert_eq!(loaded, notes);
    assert!(notes.timestamp() > DateTime::<Utc>::default());
    assert!(!cache.temp_path().exists());
  }

  #[test]
  fn test_save_replaces_previous() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::new(dir.path().join("snapshot.json"));

    let mut first = Notes {
      lines: vec!["old".to_string()],
      ..Default::default()
    };
    cache.save(&mut first).unwrap();
    let mut second = Notes {
      lines: vec!["new".to_string()],
      ..Default::default()
    };
    cache.save(&mut second).unwrap();

    let loaded: Notes = cache.load().unwrap().unwrap();
    assert_eq!(loaded.lines, vec!["new".to_string()]);
  }

  #[test]
  fn test_corrupt_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    fs::write(&path, "{ not json").unwrap();

    let err = FileCache::new(&path).load::<Notes>().unwrap_err();
    assert!(matches!(
      err.downcast_ref::<CacheError>(),
      Some(CacheError::CorruptSnapshot { .. })
    ));
  }

  #[test]
  fn test_failed_save_keeps_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    let cache = FileCache::new(&path);
    let mut notes = Notes::default();
    cache.save(&mut notes).unwrap();

    // A directory squatting on the temp path makes the write fail
    fs::create_dir(cache.temp_path()).unwrap();
    assert!(cache.save(&mut notes).is_err());

    let loaded: Option<Notes> = cache.load().unwrap();
    assert!(loaded.is_some());
  }

  #[test]
  fn test_clear() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::new(dir.path().join("snapshot.json"));

    cache.clear().unwrap();

    let mut notes = Notes::default();
    cache.save(&mut notes).unwrap();
    cache.clear().unwrap();
    assert!(!cache.path().exists());
  }
}
