//! Backing file management and first-writer initialization.
//!
//! A region is the memory-mapped image of `<cache dir>/<name>.kcache`. When
//! the shared path fails for resource reasons (directory, file, allocation,
//! mapping, lock) the region falls back to an anonymous private mapping: the
//! cache keeps working for this process but is no longer shared.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, error, warn};

use super::layout::{
    normalized_sizes, Geometry, CACHE_VERSION, OFF_CACHE_SIZE, OFF_EVICTION_POLICY,
    OFF_LOCK_KIND, OFF_LOCK_STORAGE, OFF_PAGE_SIZE, OFF_READY, OFF_TIMESTAMP, OFF_VERSION,
    LOCK_STORAGE_SIZE, READY_DONE, READY_INITIALIZING, READY_UNINITIALIZED,
};
use super::lock::{probe, LockKind, SharedLock};
use super::ordering::EvictionPolicy;
use super::segment::Segment;
use super::{now_secs, ShmCache};
use crate::config::CacheConfig;
use crate::error::{CacheError, Corruption, Result};

/// First wait between readiness checks; doubles each round.
const INIT_BACKOFF_START: Duration = Duration::from_micros(8);

pub struct Region {
    map: MmapRaw,
    base: NonNull<u8>,
    /// `None` for the private fallback mapping.
    path: Option<PathBuf>,
    lock: SharedLock,
    lock_timeout: Duration,
}

// All access to the mapping goes through the region lock or header atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map the cache at `path`, creating and initializing it if needed.
    ///
    /// Returns `Err` only for corruption; resource failures fall back to a
    /// private mapping.
    pub fn open(
        path: &Path,
        capacity: usize,
        item_size_hint: usize,
        config: &CacheConfig,
    ) -> Result<Region> {
        let (cache_size, page_size) = normalized_sizes(capacity, item_size_hint);
        let geo = Geometry::new(cache_size, page_size)?;

        match Self::open_shared(path, geo, config) {
            Ok(region) => Ok(region),
            Err(CacheError::Corrupted(reason)) => Err(reason.into()),
            Err(err) => {
                error!(
                    path = %path.display(),
                    reason = %err,
                    "unable to share cache memory, falling back to a private mapping"
                );
                Self::open_private(geo, config)
            }
        }
    }

    fn open_shared(path: &Path, geo: Geometry, config: &CacheConfig) -> Result<Region> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut map = map_file(&file, geo.total_size)?;
        if let Some(size) = Self::check_existing(&map)? {
            let on_disk = file.metadata()?.len();
            if on_disk < size as u64 {
                return Err(Corruption::SizeMismatch {
                    mapped: on_disk as usize,
                    expected: size,
                }
                .into());
            }
            debug!(
                path = %path.display(),
                size,
                "remapping at the size recorded in the header"
            );
            map = MmapOptions::new().len(size).map_raw(&file)?;
        }

        let base = base_of(&map)?;
        let lock = initialize_or_attach(base, map.len(), geo, config)?;
        Ok(Region {
            map,
            base,
            path: Some(path.to_path_buf()),
            lock,
            lock_timeout: config.lock_timeout,
        })
    }

    /// Reject a header from another format version. Returns the mapping
    /// size to use instead when the existing cache is larger than ours.
    fn check_existing(map: &MmapRaw) -> Result<Option<usize>> {
        // Safety: the view does not outlive `map`.
        let header = unsafe { Segment::from_raw(base_of(map)?, map.len()) };
        let version = header.read_u32(OFF_VERSION)?;
        if version != 0 && version != CACHE_VERSION {
            return Err(Corruption::BadVersion {
                found: version,
                expected: CACHE_VERSION,
            }
            .into());
        }
        if header.atomic_u32(OFF_READY)?.load(Ordering::Acquire) != READY_DONE {
            return Ok(None);
        }

        let stored = Geometry::new(
            header.read_u32(OFF_CACHE_SIZE)?,
            header.read_u32(OFF_PAGE_SIZE)?,
        )?;
        Ok((stored.total_size > map.len()).then_some(stored.total_size))
    }

    fn open_private(geo: Geometry, config: &CacheConfig) -> Result<Region> {
        let map = MmapRaw::from(MmapOptions::new().len(geo.total_size).map_anon()?);
        let base = base_of(&map)?;
        // Only this process sees the mapping; the spinlock is enough.
        let config = config.clone().with_lock_kind(LockKind::Spin);
        let lock = initialize_or_attach(base, map.len(), geo, &config)?;
        Ok(Region {
            map,
            base,
            path: None,
            lock,
            lock_timeout: config.lock_timeout,
        })
    }

    /// Whether other processes can see this region.
    pub fn is_shared(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lock_kind(&self) -> LockKind {
        self.lock.kind()
    }

    /// Unlocked view of the whole mapping.
    fn segment(&self) -> Segment<'_> {
        // Safety: `base` points at `map.len()` mapped bytes owned by `self`.
        unsafe { Segment::from_raw(self.base, self.map.len()) }
    }

    /// Take the region lock.
    ///
    /// The lock kind in the header must still be the one this handle
    /// attached to; otherwise the region was reinitialized under us.
    pub fn lock(&self) -> std::result::Result<RegionGuard<'_>, Corruption> {
        let found = self.segment().read_u32(OFF_LOCK_KIND)?;
        let expected = self.lock.kind().as_raw();
        if found != expected {
            return Err(Corruption::LockKindMismatch { found, expected });
        }
        self.lock.acquire(self.lock_timeout)?;
        Ok(RegionGuard { region: self })
    }

    // --- Lock-free header fields ---

    pub fn timestamp(&self) -> std::result::Result<u64, Corruption> {
        Ok(self
            .segment()
            .atomic_u64(OFF_TIMESTAMP)?
            .load(Ordering::Acquire))
    }

    pub fn set_timestamp(&self, value: u64) -> std::result::Result<(), Corruption> {
        self.segment()
            .atomic_u64(OFF_TIMESTAMP)?
            .store(value, Ordering::Release);
        Ok(())
    }

    pub fn eviction_policy(&self) -> std::result::Result<EvictionPolicy, Corruption> {
        let raw = self
            .segment()
            .atomic_u32(OFF_EVICTION_POLICY)?
            .load(Ordering::Relaxed);
        EvictionPolicy::from_raw(raw)
    }

    pub fn set_eviction_policy(
        &self,
        policy: EvictionPolicy,
    ) -> std::result::Result<(), Corruption> {
        self.segment()
            .atomic_u32(OFF_EVICTION_POLICY)?
            .store(policy.as_raw(), Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.path.is_some() {
            // Best effort; the kernel writes shared pages back anyway.
            let _ = self.map.flush_async();
        }
    }
}

/// Holds the region lock until dropped.
pub struct RegionGuard<'r> {
    region: &'r Region,
}

impl RegionGuard<'_> {
    /// Validated view of the cache structures.
    pub fn cache(&self) -> std::result::Result<ShmCache<'_>, Corruption> {
        ShmCache::attach(self.region.segment())
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.region.lock.release();
    }
}

/// Remove a cache's backing file. Missing files are not an error.
pub fn unlink(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Make sure the file holds `size` bytes on disk, then map them.
fn map_file(file: &File, size: usize) -> io::Result<MmapRaw> {
    if file.metadata()?.len() < size as u64 {
        commit(file, size)?;
    }
    MmapOptions::new().len(size).map_raw(file)
}

/// Reserve the file's blocks up front. Mapping a sparse file would turn a
/// full disk into SIGBUS on first write.
#[cfg(target_os = "linux")]
fn commit(file: &File, size: usize) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    file.set_len(size as u64)
}

#[cfg(not(target_os = "linux"))]
fn commit(file: &File, size: usize) -> io::Result<()> {
    file.set_len(size as u64)
}

fn base_of(map: &MmapRaw) -> io::Result<NonNull<u8>> {
    NonNull::new(map.as_mut_ptr())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mapping returned a null pointer"))
}

/// Run first-writer initialization, or wait for whoever is doing it.
fn initialize_or_attach(
    base: NonNull<u8>,
    len: usize,
    geo: Geometry,
    config: &CacheConfig,
) -> Result<SharedLock> {
    // Safety: callers pass a live mapping of `len` bytes.
    let seg = unsafe { Segment::from_raw(base, len) };
    let ready = seg.atomic_u32(OFF_READY)?;
    let lock_ptr = seg.ptr_at(OFF_LOCK_STORAGE, LOCK_STORAGE_SIZE)?;

    if ready
        .compare_exchange(
            READY_UNINITIALIZED,
            READY_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
    {
        let kind = match config.lock_kind {
            Some(kind) if kind.is_supported() => kind,
            _ => probe(),
        };
        if !kind.is_cross_process() {
            warn!("cache lock is a spinlock; it will not survive a crashed holder");
        }

        // Safety: we won the CAS, nobody else touches the region until we
        // publish READY_DONE.
        let lock = match unsafe { SharedLock::init(kind, lock_ptr) } {
            Ok(lock) => lock,
            Err(err) => {
                ready.store(READY_UNINITIALIZED, Ordering::Release);
                return Err(CacheError::LockUnavailable(err.to_string()));
            }
        };

        let seg = unsafe { Segment::from_raw(base, len) };
        ShmCache::initialize(seg, geo, config.eviction_policy, kind, now_secs())?;
        ready.store(READY_DONE, Ordering::Release);
        debug!(
            cache_size = geo.cache_size,
            page_size = geo.page_size,
            lock = ?kind,
            "initialized shared cache"
        );
        return Ok(lock);
    }

    let deadline = Instant::now() + config.init_timeout;
    let mut backoff = INIT_BACKOFF_START;
    while ready.load(Ordering::Acquire) != READY_DONE {
        let now = Instant::now();
        if now >= deadline {
            return Err(Corruption::InitTimeout.into());
        }
        std::thread::sleep(backoff.min(deadline - now));
        backoff = backoff.saturating_mul(2);
    }

    let raw_kind = seg.read_u32(OFF_LOCK_KIND)?;
    // Safety: READY_DONE means the lock storage holds an initialized lock.
    Ok(unsafe { SharedLock::attach(raw_kind, lock_ptr) }?)
}
