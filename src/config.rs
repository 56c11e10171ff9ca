//! Settings for opening a cache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::shm::lock::LockKind;
use crate::shm::ordering::EvictionPolicy;

/// Extension of every backing file.
pub const FILE_EXTENSION: &str = "kcache";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory holding the backing files. Defaults to the user's cache
    /// directory, or the system temp directory when there is none.
    pub cache_dir: Option<PathBuf>,
    /// How long to wait for the region lock before treating the cache as
    /// corrupt.
    pub lock_timeout: Duration,
    /// How long to wait for another process to finish initializing a new
    /// region.
    pub init_timeout: Duration,
    /// Lock primitive to use when this process creates the region. Kinds the
    /// platform cannot build are ignored in favor of probing.
    pub lock_kind: Option<LockKind>,
    /// Policy written into a newly created region.
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_dir: None,
            lock_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(8),
            lock_kind: None,
            eviction_policy: EvictionPolicy::LeastOftenUsed,
        }
    }
}

impl CacheConfig {
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_lock_kind(mut self, kind: LockKind) -> Self {
        self.lock_kind = Some(kind);
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Backing file for the cache called `name`.
    pub fn cache_path(&self, name: &str) -> PathBuf {
        cache_path_in(&self.resolved_cache_dir(), name)
    }
}

pub fn cache_path_in(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{FILE_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        assert_eq!(config.init_timeout, Duration::from_secs(8));
        assert_eq!(config.lock_kind, None);
        assert_eq!(config.eviction_policy, EvictionPolicy::LeastOftenUsed);
    }

    #[test]
    fn explicit_dir_wins() {
        let config = CacheConfig::default().with_cache_dir("/tmp/somewhere");
        assert_eq!(
            config.cache_path("icons"),
            PathBuf::from("/tmp/somewhere/icons.kcache")
        );
    }

    #[test]
    fn builder_sets_fields() {
        let config = CacheConfig::default()
            .with_lock_timeout(Duration::from_millis(5))
            .with_init_timeout(Duration::from_millis(6))
            .with_lock_kind(LockKind::Semaphore)
            .with_eviction_policy(EvictionPolicy::Oldest);
        assert_eq!(config.lock_timeout, Duration::from_millis(5));
        assert_eq!(config.init_timeout, Duration::from_millis(6));
        assert_eq!(config.lock_kind, Some(LockKind::Semaphore));
        assert_eq!(config.eviction_policy, EvictionPolicy::Oldest);
    }

    #[test]
    fn default_dir_is_absolute() {
        assert!(CacheConfig::default().resolved_cache_dir().is_absolute());
    }
}
