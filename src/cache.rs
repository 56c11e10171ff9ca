//! Public cache handle.
//!
//! `SharedDataCache` owns one mapped region and turns every structural
//! problem the engine reports into delete-and-recreate recovery: the backing
//! file is unlinked, a fresh region is built in its place and the operation
//! is retried once. Callers only ever see `bool`/`Option` results, unless
//! they use the `try_*` methods.
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, warn};

use crate::config::{cache_path_in, CacheConfig};
use crate::error::{CacheError, Result};
use crate::shm::ordering::EvictionPolicy;
use crate::shm::region::{self, Region};
use crate::shm::{CacheStats, ShmCache};

/// Where a handle is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    /// Not yet mapped.
    Uninitialized,
    /// Mapped and idle.
    Attached,
    /// Inside an operation.
    Operating,
    /// Rebuilding after corruption.
    Recovering,
    /// No usable region; every operation fails.
    Detached,
}

struct Inner {
    region: Option<Region>,
    state: CacheState,
    rng: StdRng,
    /// Regions rebuilt after corruption since the handle was opened.
    recoveries: u32,
}

/// A named, size-bounded byte cache shared by every process that opens the
/// same name.
pub struct SharedDataCache {
    name: String,
    path: PathBuf,
    capacity: usize,
    item_size_hint: usize,
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl SharedDataCache {
    /// Open (or create) the cache `name` holding about `capacity` bytes.
    ///
    /// `item_size_hint` is the expected average item size; it picks the page
    /// size. Pass 0 for the default.
    pub fn open(name: &str, capacity: usize, item_size_hint: usize) -> Self {
        Self::open_with_config(name, capacity, item_size_hint, CacheConfig::default())
    }

    pub fn open_with_config(
        name: &str,
        capacity: usize,
        item_size_hint: usize,
        config: CacheConfig,
    ) -> Self {
        let path = config.cache_path(name);
        let cache = SharedDataCache {
            name: name.to_owned(),
            path,
            capacity,
            item_size_hint,
            config,
            inner: Mutex::new(Inner {
                region: None,
                state: CacheState::Uninitialized,
                rng: StdRng::from_entropy(),
                recoveries: 0,
            }),
        };

        let region = match cache.map_region() {
            Ok(region) => Some(region),
            Err(err) if err.is_corruption() => {
                warn!(cache = %cache.name, reason = %err, "existing cache is unusable, recreating it");
                cache.unlink_backing_file();
                cache
                    .map_region()
                    .map_err(|err| {
                        error!(cache = %cache.name, reason = %err, "even a new cache is corrupt");
                    })
                    .ok()
            }
            Err(err) => {
                error!(cache = %cache.name, reason = %err, "unable to open cache");
                None
            }
        };

        {
            let mut inner = cache.inner.lock();
            inner.state = if region.is_some() {
                CacheState::Attached
            } else {
                CacheState::Detached
            };
            inner.region = region;
        }
        cache
    }

    /// Unlink the backing file of the cache `name` in the default directory.
    ///
    /// Processes that still map it keep their copy until they notice.
    pub fn delete_cache(name: &str) {
        Self::delete_cache_in(&CacheConfig::default().resolved_cache_dir(), name);
    }

    pub fn delete_cache_in(dir: &Path, name: &str) {
        let path = cache_path_in(dir, name);
        match region::unlink(&path) {
            Ok(()) => debug!(path = %path.display(), "deleted cache"),
            Err(err) => warn!(path = %path.display(), reason = %err, "unable to delete cache"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> CacheState {
        self.inner.lock().state
    }

    /// How many times an operation found the region corrupt and rebuilt it.
    pub fn recoveries(&self) -> u32 {
        self.inner.lock().recoveries
    }

    /// Whether the handle is backed by the shared file rather than a
    /// private fallback mapping.
    pub fn is_shared(&self) -> bool {
        self.inner
            .lock()
            .region
            .as_ref()
            .is_some_and(Region::is_shared)
    }

    // --- Operations ---

    /// Store `value` under `key`. An empty value removes the key.
    pub fn insert(&self, key: &str, value: &[u8]) -> bool {
        self.try_insert(key, value)
            .map_err(|err| self.report("insert", &err))
            .is_ok()
    }

    pub fn try_insert(&self, key: &str, value: &[u8]) -> Result<()> {
        if key.as_bytes().contains(&0) {
            return Err(CacheError::InvalidKey);
        }
        self.with_cache(|cache, rng| cache.insert(key.as_bytes(), value, rng))
    }

    pub fn find(&self, key: &str) -> Option<Vec<u8>> {
        self.try_find(key)
            .map_err(|err| self.report("find", &err))
            .ok()
            .flatten()
    }

    pub fn try_find(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_cache(|cache, _| cache.lookup(key.as_bytes()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.with_cache(|cache, _| cache.contains(key.as_bytes()))
            .map_err(|err| self.report("contains", &err))
            .unwrap_or(false)
    }

    /// Drop `key`. Returns whether it was stored.
    pub fn remove(&self, key: &str) -> bool {
        self.try_remove(key)
            .map_err(|err| self.report("remove", &err))
            .unwrap_or(false)
    }

    pub fn try_remove(&self, key: &str) -> Result<bool> {
        self.with_cache(|cache, _| cache.remove(key.as_bytes()))
    }

    pub fn clear(&self) {
        if let Err(err) = self.with_cache(|cache, _| cache.clear()) {
            self.report("clear", &err);
        }
    }

    /// Capacity of the arena in bytes.
    pub fn total_size(&self) -> usize {
        self.with_cache(|cache, _| Ok(cache.geometry().cache_size as usize))
            .unwrap_or(0)
    }

    /// Bytes in free pages. Fragmentation may keep a large item from fitting
    /// even when this is big enough.
    pub fn free_size(&self) -> usize {
        self.with_cache(|cache, _| {
            let free = cache.free_pages()? as usize;
            Ok(free * cache.geometry().page_size as usize)
        })
        .unwrap_or(0)
    }

    pub fn stats(&self) -> Option<CacheStats> {
        self.with_cache(|cache, _| cache.stats()).ok()
    }

    // --- Lock-free header fields ---

    pub fn eviction_policy(&self) -> EvictionPolicy {
        let inner = self.inner.lock();
        inner
            .region
            .as_ref()
            .and_then(|region| region.eviction_policy().ok())
            .unwrap_or_default()
    }

    pub fn set_eviction_policy(&self, policy: EvictionPolicy) {
        let inner = self.inner.lock();
        if let Some(region) = inner.region.as_ref() {
            if let Err(reason) = region.set_eviction_policy(policy) {
                warn!(cache = %self.name, %reason, "unable to set eviction policy");
            }
        }
    }

    /// Application-defined value stored in the header.
    pub fn timestamp(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .region
            .as_ref()
            .and_then(|region| region.timestamp().ok())
            .unwrap_or(0)
    }

    pub fn set_timestamp(&self, timestamp: u64) {
        let inner = self.inner.lock();
        if let Some(region) = inner.region.as_ref() {
            if let Err(reason) = region.set_timestamp(timestamp) {
                warn!(cache = %self.name, %reason, "unable to set timestamp");
            }
        }
    }

    // --- Internals ---

    fn map_region(&self) -> Result<Region> {
        Region::open(&self.path, self.capacity, self.item_size_hint, &self.config)
    }

    fn unlink_backing_file(&self) {
        if let Err(err) = region::unlink(&self.path) {
            warn!(cache = %self.name, reason = %err, "unable to delete corrupt cache file");
        }
    }

    /// Run `op` under the region lock, recovering once from corruption.
    fn with_cache<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut ShmCache<'_>, &mut StdRng) -> Result<T>,
    {
        let mut inner = self.inner.lock();
        let mut recovered = false;
        loop {
            let result = inner.run(&mut op);
            match result {
                Err(err) if err.is_corruption() && !recovered => {
                    warn!(cache = %self.name, reason = %err, "cache corrupted, recreating");
                    recovered = true;
                    self.recover(&mut inner)?;
                }
                other => return other,
            }
        }
    }

    /// Throw the region away and build a new one.
    fn recover(&self, inner: &mut Inner) -> Result<()> {
        inner.state = CacheState::Recovering;
        inner.recoveries = inner.recoveries.saturating_add(1);
        // Never delete a file we were not using; the private fallback has
        // nothing to do with whatever is on disk.
        let was_shared = inner.region.take().is_some_and(|region| region.is_shared());
        if was_shared {
            self.unlink_backing_file();
        }

        match self.map_region() {
            Ok(region) => {
                inner.region = Some(region);
                inner.state = CacheState::Attached;
                Ok(())
            }
            Err(err) => {
                error!(cache = %self.name, reason = %err, "unable to rebuild cache, detaching");
                inner.state = CacheState::Detached;
                Err(err)
            }
        }
    }

    fn report(&self, op: &str, err: &CacheError) {
        match err {
            CacheError::TooLarge { .. } | CacheError::InvalidKey => {
                debug!(cache = %self.name, op, reason = %err, "rejected")
            }
            _ => warn!(cache = %self.name, op, reason = %err, "cache operation failed"),
        }
    }
}

impl Inner {
    fn run<T, F>(&mut self, op: &mut F) -> Result<T>
    where
        F: FnMut(&mut ShmCache<'_>, &mut StdRng) -> Result<T>,
    {
        let Some(region) = self.region.as_ref() else {
            return Err(CacheError::Detached);
        };
        self.state = CacheState::Operating;
        let result = locked(region, &mut self.rng, op);
        self.state = CacheState::Attached;
        result
    }
}

fn locked<T, F>(region: &Region, rng: &mut StdRng, op: &mut F) -> Result<T>
where
    F: FnMut(&mut ShmCache<'_>, &mut StdRng) -> Result<T>,
{
    let guard = region.lock()?;
    let mut cache = guard.cache()?;
    op(&mut cache, rng)
}
