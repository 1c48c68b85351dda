//! Persistent cache of resolved search results
//!
//! Maps a query to the identifier list it resolved to. The key is the
//! SHA-256 of the whitespace-normalized query, so reformatted copies of the
//! same query share an entry. Entries never expire; `clear` removes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::utils::text::{normalize_whitespace, truncate_chars};

/// Stored query text is truncated to this many characters
const QUERY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedQueryResult {
    pub query: String,
    pub ids: Vec<String>,
    pub count: usize,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheInfo {
    pub path: PathBuf,
    pub entries: usize,
    pub total_ids: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Content-addressed query cache backed by one JSON file
pub struct ResultCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, CachedQueryResult>>,
}

/// Stable cache key for a query
pub fn cache_key(query: &str) -> String {
    let normalized = normalize_whitespace(query);
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

impl ResultCache {
    /// Open the cache file, starting empty if it is missing or unreadable
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring unreadable query cache {:?}: {}", path, e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        debug!("Query cache {:?} holds {} entries", path, entries.len());

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CachedQueryResult>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The exact stored list, if any
    pub fn get(&self, query: &str) -> Option<Vec<String>> {
        let key = cache_key(query);
        let entries = self.lock();
        entries.get(&key).map(|entry| {
            info!(
                "Using cached results for query ({} ids, cached {})",
                entry.count,
                entry.cached_at.to_rfc3339()
            );
            entry.ids.clone()
        })
    }

    /// Overwrite the entry for `query` and persist immediately
    pub fn set(&self, query: &str, ids: &[String]) -> Result<(), CacheError> {
        let key = cache_key(query);
        let mut entries = self.lock();
        entries.insert(
            key,
            CachedQueryResult {
                query: truncate_chars(&normalize_whitespace(query), QUERY_PREVIEW_CHARS).to_string(),
                ids: ids.to_vec(),
                count: ids.len(),
                cached_at: Utc::now(),
            },
        );
        self.persist(&entries)?;
        debug!("Cached {} ids for query", ids.len());
        Ok(())
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut entries = self.lock();
        let removed = entries.len();
        entries.clear();
        self.persist(&entries)?;
        info!("Cleared {} cached queries", removed);
        Ok(removed)
    }

    pub fn info(&self) -> CacheInfo {
        let entries = self.lock();
        CacheInfo {
            path: self.path.clone(),
            entries: entries.len(),
            total_ids: entries.values().map(|e| e.count).sum(),
            oldest: entries.values().map(|e| e.cached_at).min(),
            newest: entries.values().map(|e| e.cached_at).max(),
        }
    }

    /// Write to a sibling temp file then rename over the cache file
    fn persist(&self, entries: &BTreeMap<String, CachedQueryResult>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_set_then_get_returns_exact_list() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::open(dir.path().join("cache").join("query_cache.json"));

        let stored = ids(&["3", "1", "2"]);
        cache.set("(cancer) AND therapy", &stored).unwrap();
        assert_eq!(cache.get("(cancer) AND therapy"), Some(stored.clone()));

        // whitespace-only differences hit the same entry
        assert_eq!(cache.get("  (cancer)\n   AND\ttherapy "), Some(stored));
        assert_eq!(cache.get("(cancer) OR therapy"), None);
    }

    #[test]
    fn test_set_overwrites_and_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("query_cache.json");

        let cache = ResultCache::open(&path);
        cache.set("q", &ids(&["1", "2"])).unwrap();
        cache.set("q", &ids(&["9"])).unwrap();
        drop(cache);

        let reopened = ResultCache::open(&path);
        assert_eq!(reopened.get("q"), Some(ids(&["9"])));
        assert_eq!(reopened.info().entries, 1);
    }

    #[test]
    fn test_empty_result_is_cached() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::open(dir.path().join("c.json"));
        cache.set("nothing matches", &[]).unwrap();
        assert_eq!(cache.get("nothing matches"), Some(Vec::new()));
    }

    #[test]
    fn test_clear_and_info() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::open(dir.path().join("c.json"));
        cache.set("a", &ids(&["1"])).unwrap();
        cache.set("b", &ids(&["2", "3"])).unwrap();

        let info = cache.info();
        assert_eq!(info.entries, 2);
        assert_eq!(info.total_ids, 3);
        assert!(info.oldest <= info.newest);

        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(ResultCache::open(dir.path().join("c.json")).info().entries, 0);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.json");
        fs::write(&path, "not json").unwrap();
        assert_eq!(ResultCache::open(&path).info().entries, 0);
    }

    #[test]
    fn test_cache_key_is_hex_sha256() {
        let key = cache_key("a  b");
        assert_eq!(key.len(), 64);
        assert_eq!(key, cache_key("a b"));
    }
}
