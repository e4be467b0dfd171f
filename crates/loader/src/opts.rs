//! Loader configuration.

use hmyload_core::{LoadError, LoadResult};
use hmyload_provider::{ConnectionOpts, RetryPolicy, SignatureDirectory};
use hmyload_store::CacheRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Directory name under the user cache dir when none is configured.
pub const CACHE_DIR_NAME: &str = "harmony-tk";

pub const DEFAULT_PAGE_SIZE: u64 = 50_000;
pub const DEFAULT_PAGE_OVERLAP: u64 = 50;
pub const DEFAULT_CHUNK_SIZE: usize = 5_000;

/// Options for [`crate::Loader::connect`].
///
/// Loaders that may point at the same cache directory must share one
/// registry: clone the options, or pass the same `Arc` to `with_registry`.
///
/// ```ignore
/// let opts = LoaderOpts::default()
///     .with_additional_connections(3)
///     .with_cache_dir("/tmp/hmy-cache");
/// ```
#[derive(Clone)]
pub struct LoaderOpts {
    pub additional_connections: usize,
    pub rpc_timeout: Duration,
    pub cache_dir: Option<PathBuf>,
    pub preload_cache: bool,
    pub page_size: u64,
    pub page_overlap: u64,
    pub chunk_size: usize,
    pub retry: RetryPolicy,
    pub registry: Arc<CacheRegistry>,
    pub directory: Option<Arc<dyn SignatureDirectory>>,
}

impl Default for LoaderOpts {
    fn default() -> Self {
        Self {
            additional_connections: 1,
            rpc_timeout: Duration::from_secs(120),
            cache_dir: None,
            preload_cache: false,
            page_size: DEFAULT_PAGE_SIZE,
            page_overlap: DEFAULT_PAGE_OVERLAP,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            registry: Arc::new(CacheRegistry::new()),
            directory: None,
        }
    }
}

impl LoaderOpts {
    pub fn with_additional_connections(mut self, n: usize) -> Self {
        self.additional_connections = n;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Load every cached record into memory when the loader opens.
    pub fn with_preload_cache(mut self, preload: bool) -> Self {
        self.preload_cache = preload;
        self
    }

    pub fn with_page_size(mut self, size: u64) -> Self {
        self.page_size = size;
        self
    }

    pub fn with_page_overlap(mut self, overlap: u64) -> Self {
        self.page_overlap = overlap;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_registry(mut self, registry: Arc<CacheRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn SignatureDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Total connections: the default one plus the additional ones.
    pub fn pool_size(&self) -> usize {
        1 + self.additional_connections
    }

    pub fn connection_opts(&self) -> ConnectionOpts {
        ConnectionOpts {
            timeout: self.rpc_timeout,
            retry: self.retry,
        }
    }

    pub fn resolve_cache_dir(&self) -> LoadResult<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        dirs::cache_dir()
            .map(|d| d.join(CACHE_DIR_NAME))
            .ok_or_else(|| LoadError::Cache("No user cache directory; set a cache dir explicitly".into()))
    }

    pub(crate) fn validate(&self) -> LoadResult<()> {
        if self.page_size == 0 {
            return Err(LoadError::InvalidInput("page size must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(LoadError::InvalidInput("chunk size must be positive".into()));
        }
        if self.page_overlap >= self.page_size {
            return Err(LoadError::InvalidInput(format!(
                "page overlap {} must be smaller than page size {}",
                self.page_overlap, self.page_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = LoaderOpts::default();
        assert_eq!(opts.pool_size(), 2);
        assert_eq!(opts.rpc_timeout, Duration::from_secs(120));
        assert_eq!(opts.page_size, 50_000);
        assert_eq!(opts.page_overlap, 50);
        assert_eq!(opts.chunk_size, 5_000);
        assert_eq!(opts.retry.max_retries, 3);
        assert!(!opts.preload_cache);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn explicit_cache_dir_wins() {
        let opts = LoaderOpts::default().with_cache_dir("/tmp/hmy");
        assert_eq!(opts.resolve_cache_dir().unwrap(), PathBuf::from("/tmp/hmy"));
    }

    #[test]
    fn rejects_overlap_not_below_page() {
        let opts = LoaderOpts::default().with_page_size(10).with_page_overlap(10);
        assert!(matches!(opts.validate(), Err(LoadError::InvalidInput(_))));
    }

    #[test]
    fn clones_share_registry() {
        let a = LoaderOpts::default();
        let b = a.clone();
        assert!(Arc::ptr_eq(&a.registry, &b.registry));
    }
}
