//! Path-keyed registry so loaders pointed at one directory share one store.
//!
//! rocksdb allows a single open handle per directory and process, so a second
//! loader must reuse the first loader's [`Cache`] instead of reopening it.

use crate::cache::Cache;
use hmyload_core::{LoadError, LoadResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maps canonical cache paths to their open [`Cache`].
///
/// Pass one registry (behind an `Arc`) to every loader that may share a cache
/// directory. Release through [`CacheRegistry::release`] so the entry goes
/// away with the last reference; a cache closed behind the registry's back is
/// replaced on next open.
#[derive(Default)]
pub struct CacheRegistry {
    open: Mutex<HashMap<PathBuf, Arc<Cache>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared cache for `path`, opening it on first use. Every
    /// successful call must be balanced by one [`CacheRegistry::release`].
    pub fn open(&self, path: &Path) -> LoadResult<Arc<Cache>> {
        std::fs::create_dir_all(path).map_err(|e| {
            LoadError::Cache(format!("Failed to create cache dir {}: {e}", path.display()))
        })?;
        let canonical = path.canonicalize().map_err(|e| {
            LoadError::Cache(format!("Failed to resolve cache dir {}: {e}", path.display()))
        })?;

        let mut open = self.open.lock();
        if let Some(cache) = open.get(&canonical) {
            if cache.retain().is_ok() {
                tracing::debug!(path = %canonical.display(), refs = cache.ref_count(), "cache shared");
                return Ok(cache.clone());
            }
        }

        let cache = Arc::new(Cache::open(&canonical)?);
        open.insert(canonical, cache.clone());
        Ok(cache)
    }

    /// Drops one reference to `cache`. When that closes it, the entry is
    /// removed. Returns `true` if the store was closed.
    pub fn release(&self, cache: &Arc<Cache>) -> LoadResult<bool> {
        let mut open = self.open.lock();
        let closed = cache.release()?;
        if closed {
            let path = cache.path();
            if open.get(path).is_some_and(|entry| Arc::ptr_eq(entry, cache)) {
                open.remove(path);
            }
        }
        Ok(closed)
    }

    /// Number of paths whose cache is still open.
    pub fn open_count(&self) -> usize {
        self.open.lock().values().filter(|c| c.is_open()).count()
    }
}
