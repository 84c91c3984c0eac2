//! Content memo cache.
//!
//! Values are keyed by (path, field) and stored as JSON so the whole cache
//! can be persisted between runs. Every entry remembers the mtime of its
//! file when it was computed; a persisted entry whose file has since
//! changed is dropped on load.

use haste_util::fs::{atomic_write, mtime_ms};
use haste_util::hash::blake3_key;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PathEntry {
    mtime: Option<u64>,
    fields: FxHashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache {
    version: String,
    entries: FxHashMap<PathBuf, PathEntry>,
}

/// Memo store shared by the module registry and the bundler.
#[derive(Debug, Default)]
pub struct Cache {
    entries: RwLock<FxHashMap<PathBuf, PathEntry>>,
    version: String,
    file: Option<PathBuf>,
}

impl Cache {
    /// A cache that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Cache namespace for a given version string, root set and transformer.
    ///
    /// Upgrading the transformer (new mtime) or changing roots yields a new key.
    #[must_use]
    pub fn version_key(version: &str, roots: &[PathBuf], transformer: Option<&Path>) -> String {
        let mut parts = vec![version.to_string()];
        parts.extend(roots.iter().map(|r| r.to_string_lossy().into_owned()));
        let transformer_mtime = transformer.and_then(mtime_ms).unwrap_or(0);
        parts.push(transformer_mtime.to_string());
        blake3_key(&parts)
    }

    /// Open a persistent cache in `dir`, loading any previous contents
    /// unless `reset` is set.
    #[must_use]
    pub fn persistent(dir: &Path, version_key: String, reset: bool) -> Self {
        let file = dir.join(format!("haste-cache-{}.json", &version_key[..16.min(version_key.len())]));
        let mut entries = FxHashMap::default();

        if reset {
            info!(path = %file.display(), "Resetting cache");
        } else {
            match std::fs::read(&file) {
                Ok(bytes) => match serde_json::from_slice::<PersistedCache>(&bytes) {
                    Ok(persisted) if persisted.version == version_key => {
                        let total = persisted.entries.len();
                        entries = persisted
                            .entries
                            .into_iter()
                            .filter(|(path, entry)| mtime_ms(path) == entry.mtime)
                            .collect();
                        debug!(
                            kept = entries.len(),
                            dropped = total - entries.len(),
                            "Loaded persisted cache"
                        );
                    }
                    Ok(_) => debug!("Persisted cache version mismatch, starting empty"),
                    Err(e) => warn!(error = %e, path = %file.display(), "Ignoring corrupt cache file"),
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, path = %file.display(), "Failed to read cache file"),
            }
        }

        Self {
            entries: RwLock::new(entries),
            version: version_key,
            file: Some(file),
        }
    }

    /// Memoized value for `(path, field)`, computing and storing it if absent.
    ///
    /// A value that fails to (de)serialize is recomputed and not stored.
    ///
    /// # Errors
    /// Propagates the error from `compute`.
    pub fn get<T, E, F>(&self, path: &Path, field: &str, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        let cached = self
            .entries
            .read()
            .unwrap()
            .get(path)
            .and_then(|entry| entry.fields.get(field).cloned());
        if let Some(value) = cached {
            if let Ok(v) = serde_json::from_value(value) {
                return Ok(v);
            }
        }

        let value = compute()?;
        if let Ok(json) = serde_json::to_value(&value) {
            let mtime = mtime_ms(path);
            let mut entries = self.entries.write().unwrap();
            let entry = entries.entry(path.to_path_buf()).or_default();
            if entry.mtime != mtime {
                entry.fields.clear();
                entry.mtime = mtime;
            }
            entry.fields.insert(field.to_string(), json);
        }
        Ok(value)
    }

    #[must_use]
    pub fn contains(&self, path: &Path, field: &str) -> bool {
        self.entries
            .read()
            .unwrap()
            .get(path)
            .is_some_and(|e| e.fields.contains_key(field))
    }

    /// Drop every field stored for `path`.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.entries.write().unwrap().remove(path).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the cache to disk. No-op for in-memory caches.
    ///
    /// # Errors
    /// Returns an error if serialization or the atomic write fails.
    pub fn persist(&self) -> io::Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let persisted = PersistedCache {
            version: self.version.clone(),
            entries: self.entries.read().unwrap().clone(),
        };
        let bytes = serde_json::to_vec(&persisted)?;
        atomic_write(file, &bytes)?;
        debug!(path = %file.display(), entries = persisted.entries.len(), "Persisted cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_get_memoizes() {
        let cache = Cache::in_memory();
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            Ok::<_, ()>(vec!["a".to_string()])
        };
        let path = Path::new("/virtual/a.js");
        assert_eq!(cache.get(path, "dependencies", compute).unwrap(), vec!["a"]);
        assert_eq!(cache.get(path, "dependencies", compute).unwrap(), vec!["a"]);
        assert_eq!(calls.get(), 1);

        cache.invalidate(path);
        cache.get(path, "dependencies", compute).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_compute_error_is_not_cached() {
        let cache = Cache::in_memory();
        let path = Path::new("/virtual/b.js");
        let err: Result<u32, &str> = cache.get(path, "x", || Err("boom"));
        assert!(err.is_err());
        assert!(!cache.contains(path, "x"));
    }

    #[test]
    fn test_persist_and_reload_drops_stale() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.js");
        let b = dir.path().join("b.js");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();
        let key = Cache::version_key("1", &[dir.path().to_path_buf()], None);
        let cache_dir = dir.path().join("cache");

        let cache = Cache::persistent(&cache_dir, key.clone(), false);
        cache.get(&a, "isHaste", || Ok::<_, ()>(true)).unwrap();
        cache.get(&b, "isHaste", || Ok::<_, ()>(false)).unwrap();
        cache.persist().unwrap();

        // Force a different mtime for b.
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&b, "changed").unwrap();
        let reloaded = Cache::persistent(&cache_dir, key.clone(), false);
        assert!(reloaded.contains(&a, "isHaste"));
        if mtime_ms(&b) != mtime_ms(&a) {
            assert!(!reloaded.contains(&b, "isHaste"));
        }

        let reset = Cache::persistent(&cache_dir, key, true);
        assert!(reset.is_empty());
    }

    #[test]
    fn test_version_key_changes_with_roots() {
        let a = Cache::version_key("1", &[PathBuf::from("/a")], None);
        let b = Cache::version_key("1", &[PathBuf::from("/b")], None);
        assert_ne!(a, b);
    }
}
