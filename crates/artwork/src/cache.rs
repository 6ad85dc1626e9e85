//! TTL + size-bounded cache of resolved artwork assets.
//!
//! Maps an external image reference to the remote asset id it resolved
//! to. Entries are persisted to a JSON index file so warm restarts skip
//! redundant registrations.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How long a resolved asset stays valid.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Total byte budget across all live entries (25 MB).
pub const DEFAULT_MAX_BYTES: u64 = 25 * 1024 * 1024;

/// Errors from cache persistence.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A freshly resolved asset: the id plus its source size for budgeting.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAsset {
    pub asset: String,
    pub size_bytes: u64,
}

/// One persisted cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexedEntry {
    url: String,
    asset: String,
    #[serde(rename = "storedAt")]
    stored_at: u64,
    #[serde(rename = "sizeBytes")]
    size_bytes: u64,
}

/// On-disk index schema.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: Vec<IndexedEntry>,
}

#[derive(Default)]
struct Inner {
    /// Least-recently-used first.
    entries: Vec<IndexedEntry>,
    total_bytes: u64,
    loaded: bool,
}

/// Artwork cache keyed by the original image reference.
///
/// All mutable state sits behind one lock; the caller's fetch runs
/// *outside* it so slow network I/O never serializes unrelated lookups.
pub struct ArtworkCache {
    path: PathBuf,
    ttl_millis: u64,
    max_bytes: u64,
    inner: Mutex<Inner>,
}

impl ArtworkCache {
    /// Creates a cache backed by the given index file.
    ///
    /// The index is loaded lazily on first use.
    pub fn new(path: PathBuf) -> Self {
        Self::with_limits(path, DEFAULT_TTL, DEFAULT_MAX_BYTES)
    }

    /// Creates a cache with explicit TTL and byte budget.
    pub fn with_limits(path: PathBuf, ttl: Duration, max_bytes: u64) -> Self {
        Self {
            path,
            ttl_millis: ttl.as_millis() as u64,
            max_bytes,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns the cached asset for `url`, or runs `fetch` and caches its
    /// result.
    ///
    /// The fetch happens unlocked; afterwards the cache is re-checked so a
    /// racing caller that resolved the same URL first wins and the
    /// duplicate result is discarded.
    pub async fn get_or_fetch<F, Fut>(&self, url: &str, fetch: F) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<ResolvedAsset>>,
    {
        if let Some(asset) = self.lookup_at(url, now_millis()) {
            debug!(url, "artwork cache hit");
            return Some(asset);
        }

        let resolved = fetch().await?;
        Some(self.insert_at(url, resolved, now_millis()))
    }

    /// Empties the cache and deletes the persisted index file.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.total_bytes = 0;
        inner.loaded = true;
        drop(inner);
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = ?self.path, error = %e, "failed to delete artwork index");
        }
    }

    /// Looks up a live entry and touches it (moves to most-recently-used).
    fn lookup_at(&self, url: &str, now: u64) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        self.ensure_loaded(&mut inner, now);

        let idx = inner.entries.iter().position(|e| e.url == url)?;
        if self.is_expired(&inner.entries[idx], now) {
            let dropped = inner.entries.remove(idx);
            inner.total_bytes = inner.total_bytes.saturating_sub(dropped.size_bytes);
            return None;
        }

        let entry = inner.entries.remove(idx);
        let asset = entry.asset.clone();
        inner.entries.push(entry);
        Some(asset)
    }

    /// Inserts a resolved asset, evicting oldest entries over budget, and
    /// persists the index.
    ///
    /// If a racing caller already populated a live entry for `url`, that
    /// entry's asset is returned instead and `resolved` is discarded.
    fn insert_at(&self, url: &str, resolved: ResolvedAsset, now: u64) -> String {
        let mut inner = self.inner.lock().unwrap();
        self.ensure_loaded(&mut inner, now);

        if let Some(idx) = inner.entries.iter().position(|e| e.url == url) {
            if !self.is_expired(&inner.entries[idx], now) {
                let entry = inner.entries.remove(idx);
                let asset = entry.asset.clone();
                inner.entries.push(entry);
                return asset;
            }
            let dropped = inner.entries.remove(idx);
            inner.total_bytes = inner.total_bytes.saturating_sub(dropped.size_bytes);
        }

        let asset = resolved.asset.clone();
        inner.total_bytes += resolved.size_bytes;
        inner.entries.push(IndexedEntry {
            url: url.to_string(),
            asset: resolved.asset,
            stored_at: now,
            size_bytes: resolved.size_bytes,
        });

        // Oldest-first eviction until the budget is respected; the entry
        // just inserted is never evicted while older ones remain.
        while inner.total_bytes > self.max_bytes && inner.entries.len() > 1 {
            let evicted = inner.entries.remove(0);
            inner.total_bytes = inner.total_bytes.saturating_sub(evicted.size_bytes);
            debug!(url = %evicted.url, size = evicted.size_bytes, "evicted artwork entry");
        }

        if let Err(e) = self.persist(&inner) {
            warn!(path = ?self.path, error = %e, "failed to persist artwork index");
        }
        asset
    }

    fn is_expired(&self, entry: &IndexedEntry, now: u64) -> bool {
        now.saturating_sub(entry.stored_at) >= self.ttl_millis
    }

    /// Loads the persisted index on first use, dropping expired entries.
    fn ensure_loaded(&self, inner: &mut Inner, now: u64) {
        if inner.loaded {
            return;
        }
        inner.loaded = true;

        let index = match load_index(&self.path) {
            Ok(index) => index,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "failed to load artwork index");
                return;
            }
        };

        for entry in index.entries {
            if now.saturating_sub(entry.stored_at) >= self.ttl_millis {
                continue;
            }
            inner.total_bytes += entry.size_bytes;
            inner.entries.push(entry);
        }
        debug!(
            path = ?self.path,
            entries = inner.entries.len(),
            bytes = inner.total_bytes,
            "loaded artwork index"
        );
    }

    fn persist(&self, inner: &Inner) -> Result<(), CacheError> {
        let index = IndexFile {
            entries: inner.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&index)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

fn load_index(path: &Path) -> Result<IndexFile, CacheError> {
    if !path.exists() {
        return Ok(IndexFile::default());
    }
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
