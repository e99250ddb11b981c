use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::types::Item;

/// Durable per-collection persistence: the last full-collection snapshot
/// (with a freshness window) and the set of mints already reported as rare.
///
/// Everything here is synchronous and best-effort. A failed read is a cache
/// miss, a failed write is logged and reported as `false`, and nothing
/// propagates an error past this boundary; callers just fall back to the
/// remote API or lose dedup state for the run.
pub struct CacheStore {
    dir: PathBuf,
    enabled: bool,
    expiry: Duration,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>, enabled: bool, expiry: Duration) -> Self {
        Self { dir: dir.into(), enabled, expiry }
    }

    fn snapshot_path(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.items.json"))
    }

    fn seen_path(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.seen.json"))
    }

    /// The persisted full-collection snapshot, or None if caching is off, the
    /// file is missing/unreadable, or it is older than the expiry window.
    /// Stale files are left in place; the next write supersedes them.
    pub fn read_snapshot(&self, symbol: &str) -> Option<Vec<Item>> {
        if !self.enabled {
            return None;
        }
        let path = self.snapshot_path(symbol);
        if !is_fresh(&path, self.expiry) {
            debug!(symbol, "snapshot cache miss (absent or expired)");
            return None;
        }
        match fs::read_to_string(&path).map_err(|e| e.to_string()).and_then(|raw| {
            serde_json::from_str::<Vec<Item>>(&raw).map_err(|e| e.to_string())
        }) {
            Ok(items) => {
                info!(symbol, items = items.len(), "reusing cached collection snapshot");
                Some(items)
            }
            Err(e) => {
                warn!(symbol, "unreadable snapshot cache, treating as miss: {e}");
                None
            }
        }
    }

    /// Overwrite the snapshot wholesale. Returns false (not written) when
    /// caching is disabled or the write fails.
    pub fn write_snapshot(&self, symbol: &str, items: &[Item]) -> bool {
        if !self.enabled {
            return false;
        }
        match self.write_json(&self.snapshot_path(symbol), items) {
            Ok(()) => {
                debug!(symbol, items = items.len(), "snapshot written");
                true
            }
            Err(e) => {
                warn!(symbol, "snapshot write failed: {e}");
                false
            }
        }
    }

    /// The persisted seen-mint set. Missing or malformed reads as empty;
    /// losing dedup history degrades to re-notifying, never to a crash.
    pub fn read_seen(&self, symbol: &str) -> HashSet<String> {
        let path = self.seen_path(symbol);
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(mints) => mints.into_iter().collect(),
                Err(e) => {
                    warn!(symbol, "malformed seen-set file, starting empty: {e}");
                    HashSet::new()
                }
            },
            Err(_) => HashSet::new(),
        }
    }

    /// Overwrite the seen-mint set wholesale. The seen set persists even when
    /// snapshot caching is disabled; dedup must survive restarts regardless.
    pub fn write_seen(&self, symbol: &str, seen: &HashSet<String>) -> bool {
        let mut mints: Vec<&String> = seen.iter().collect();
        mints.sort();
        match self.write_json(&self.seen_path(symbol), &mints) {
            Ok(()) => true,
            Err(e) => {
                warn!(symbol, "seen-set write failed: {e}");
                false
            }
        }
    }

    /// Manual cache invalidation: deletes the snapshot file only. The seen
    /// set is untouched. Clearing rarity dedup is a separate, deliberate act.
    pub fn clear(&self, symbol: &str) {
        let path = self.snapshot_path(symbol);
        match fs::remove_file(&path) {
            Ok(()) => info!(symbol, "snapshot cache cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(symbol, "snapshot cache clear failed: {e}"),
        }
    }

    // ?Sized so slices serialize directly, without an intermediate Vec.
    fn write_json<T: serde::Serialize + ?Sized>(&self, path: &Path, value: &T) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let raw = serde_json::to_string_pretty(value)?;
        fs::write(path, raw)
    }
}

/// True if `path` exists and was modified within `expiry` of now.
fn is_fresh(path: &Path, expiry: Duration) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age <= expiry,
        // Clock skew put mtime in the future; treat as fresh.
        Err(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
