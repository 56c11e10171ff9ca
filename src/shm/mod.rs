//! Shared-memory cache backend.
//!
//! `ShmCache` is a validated, lock-holding view over one mapped region:
//! header, index table, page table and page arena (see `layout`). Every
//! structural check failure surfaces as a `Corruption` error; nothing here
//! tries to repair the region, that is the façade's job.
pub mod allocator;
pub mod hashtable;
pub mod layout;
pub mod lock;
pub mod ordering;
pub mod region;
pub mod segment;

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, trace};

use crate::error::{CacheError, Corruption, Result};
use hashtable::{hash_key, probe_position, MAX_PROBE_COUNT};
use layout::{
    Geometry, IndexEntry, PageId, Slot, CACHE_VERSION, OFF_CACHE_SIZE, OFF_EVICTION_POLICY,
    OFF_FREE_PAGES, OFF_LOCK_KIND, OFF_PAGE_SIZE, OFF_TIMESTAMP, OFF_VERSION,
};
use lock::LockKind;
use ordering::EvictionPolicy;
use segment::Segment;

/// Load factor below which colliding entries are never culled.
const START_CULL_LOAD: f64 = 0.5;
/// Load factor from which colliding entries are always culled.
const MUST_CULL_LOAD: f64 = 0.96;
/// Entries idle for longer than this may lose use count on collision.
const CULL_IDLE_NANOS: u64 = 60 * 1_000_000_000;

/// Point-in-time view of the cache's bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub page_size: u32,
    pub page_count: u32,
    pub free_pages: u32,
    pub live_entries: u32,
    /// Pages held by live entries, computed from their sizes.
    pub pages_owned: u32,
}

/// Validated access to the region's structures. Only exists while the
/// region lock is held (or during first-writer initialization).
pub struct ShmCache<'a> {
    seg: Segment<'a>,
    geo: Geometry,
}

impl<'a> ShmCache<'a> {
    /// Check the header and derive the geometry.
    pub fn attach(seg: Segment<'a>) -> std::result::Result<Self, Corruption> {
        let version = seg.read_u32(OFF_VERSION)?;
        if version != CACHE_VERSION {
            return Err(Corruption::BadVersion {
                found: version,
                expected: CACHE_VERSION,
            });
        }

        let geo = Geometry::new(seg.read_u32(OFF_CACHE_SIZE)?, seg.read_u32(OFF_PAGE_SIZE)?)?;
        if geo.total_size > seg.len() {
            return Err(Corruption::SizeMismatch {
                mapped: seg.len(),
                expected: geo.total_size,
            });
        }

        EvictionPolicy::from_raw(seg.read_u32(OFF_EVICTION_POLICY)?)?;

        let free = seg.read_u32(OFF_FREE_PAGES)?;
        if free > geo.page_count {
            return Err(Corruption::FreeCountOverflow {
                free,
                total: geo.page_count,
            });
        }

        Ok(ShmCache { seg, geo })
    }

    /// Write a fresh header and empty tables.
    pub fn initialize(
        mut seg: Segment<'a>,
        geo: Geometry,
        policy: EvictionPolicy,
        lock_kind: LockKind,
        timestamp: u64,
    ) -> std::result::Result<Self, Corruption> {
        seg.check(0, geo.total_size)?;
        seg.write_u32(OFF_VERSION, CACHE_VERSION)?;
        seg.write_u64(OFF_TIMESTAMP, timestamp)?;
        seg.write_u32(OFF_CACHE_SIZE, geo.cache_size)?;
        seg.write_u32(OFF_PAGE_SIZE, geo.page_size)?;
        seg.write_u32(OFF_EVICTION_POLICY, policy.as_raw())?;
        seg.write_u32(OFF_LOCK_KIND, lock_kind.as_raw())?;

        let mut cache = ShmCache { seg, geo };
        cache.clear_tables()?;
        Ok(cache)
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    // --- Raw structure accessors ---

    pub fn entry(&self, slot: Slot) -> std::result::Result<IndexEntry, Corruption> {
        let bytes = self.seg.read_array(self.geo.index_entry_offset(slot))?;
        Ok(IndexEntry::decode(&bytes))
    }

    pub fn set_entry(
        &mut self,
        slot: Slot,
        entry: &IndexEntry,
    ) -> std::result::Result<(), Corruption> {
        let offset = self.geo.index_entry_offset(slot);
        self.seg
            .bytes_mut(offset, IndexEntry::SIZE)?
            .copy_from_slice(&entry.encode());
        Ok(())
    }

    /// Raw owner of `page`: a slot number, or `PAGE_NONE`.
    pub fn page_owner(&self, page: PageId) -> std::result::Result<i32, Corruption> {
        self.seg.read_i32(self.geo.page_entry_offset(page))
    }

    pub fn set_page_owner(
        &mut self,
        page: PageId,
        owner: i32,
    ) -> std::result::Result<(), Corruption> {
        let offset = self.geo.page_entry_offset(page);
        self.seg.write_i32(offset, owner)
    }

    pub fn free_pages(&self) -> std::result::Result<u32, Corruption> {
        self.seg.read_u32(OFF_FREE_PAGES)
    }

    pub fn set_free_pages(&mut self, free: u32) -> std::result::Result<(), Corruption> {
        self.seg.write_u32(OFF_FREE_PAGES, free)
    }

    pub fn eviction_policy(&self) -> std::result::Result<EvictionPolicy, Corruption> {
        EvictionPolicy::from_raw(self.seg.read_u32(OFF_EVICTION_POLICY)?)
    }

    // --- Cache operations ---

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// An empty value removes the key.
    pub fn insert<R: Rng + ?Sized>(&mut self, key: &[u8], value: &[u8], rng: &mut R) -> Result<()> {
        if key.contains(&0) {
            return Err(CacheError::InvalidKey);
        }
        if value.is_empty() {
            self.remove(key)?;
            return Ok(());
        }

        // Stored as key, NUL, value.
        let total = key.len() + 1 + value.len();
        let pages = self.geo.pages_for(total);
        if pages >= self.geo.page_count as usize {
            return Err(CacheError::TooLarge {
                size: total,
                pages: u32::try_from(pages).unwrap_or(u32::MAX),
                page_count: self.geo.page_count,
            });
        }
        let pages = pages as u32;
        let hash = hash_key(key);

        if let Some(existing) = self.find_entry(key)? {
            self.remove_entry(existing)?;
        }

        let cull = rng.gen::<f64>() < self.cull_probability()?;
        let now = now_nanos();
        let slot = self.insert_position(hash, cull, now)?;
        if self.entry(slot)?.is_live() {
            debug!(slot = slot.get(), "overwriting colliding entry");
            self.remove_entry(slot)?;
        }

        let first = match self.allocate_pages(pages)? {
            Some(first) => first,
            None => self.evict(pages)?.ok_or(CacheError::NoSpace(pages))?,
        };

        let free = self.free_pages()?;
        if free < pages {
            return Err(Corruption::FreeCountUnderflow {
                free,
                needed: pages,
            }
            .into());
        }
        for raw in first.get()..first.get() + pages {
            let page = self.geo.page(i64::from(raw))?;
            self.set_page_owner(page, slot.get() as i32)?;
        }
        self.set_entry(
            slot,
            &IndexEntry {
                hash,
                total_size: total as u32,
                use_count: 1,
                first_page: first.get() as i32,
                add_time: now,
                last_used: now,
            },
        )?;
        self.set_free_pages(free - pages)?;

        let data = self.seg.bytes_mut(self.geo.page_offset(first), total)?;
        data[..key.len()].copy_from_slice(key);
        data[key.len()] = 0;
        data[key.len() + 1..].copy_from_slice(value);

        trace!(slot = slot.get(), pages, "stored entry");
        Ok(())
    }

    /// Copy out the value for `key`, counting the access.
    pub fn lookup(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(slot) = self.find_entry(key)? else {
            return Ok(None);
        };
        let entry = self.touch(slot)?;

        let prefix = key.len() + 1;
        let total = entry.total_size as usize;
        let first = self.geo.page(i64::from(entry.first_page))?;
        let start = self.geo.page_offset(first);
        if start + total > self.geo.total_size {
            return Err(Corruption::BadItemSize(entry.total_size).into());
        }
        Ok(Some(self.seg.bytes(start + prefix, total - prefix)?.to_vec()))
    }

    /// Whether `key` is stored. Counts as an access.
    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        match self.find_entry(key)? {
            Some(slot) => {
                self.touch(slot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop `key` if present. Returns whether it was.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        match self.find_entry(key)? {
            Some(slot) => {
                self.remove_entry(slot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.clear_tables()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut live_entries = 0u32;
        let mut pages_owned = 0u32;
        for raw in 0..self.geo.index_len {
            let entry = self.entry(self.geo.slot(i64::from(raw))?)?;
            if entry.is_live() {
                live_entries += 1;
                pages_owned += self.geo.pages_for(entry.total_size as usize) as u32;
            }
        }
        Ok(CacheStats {
            page_size: self.geo.page_size,
            page_count: self.geo.page_count,
            free_pages: self.free_pages()?,
            live_entries,
            pages_owned,
        })
    }

    /// Chance that this insert culls idle colliding entries: zero up to half
    /// full, rising linearly to one at `MUST_CULL_LOAD`.
    fn cull_probability(&self) -> std::result::Result<f64, Corruption> {
        let free = f64::from(self.free_pages()?);
        let load = 1.0 - free / f64::from(self.geo.page_count);
        Ok(((load - START_CULL_LOAD) / (MUST_CULL_LOAD - START_CULL_LOAD)).clamp(0.0, 1.0))
    }

    /// Pick the slot for a new entry with `hash`.
    ///
    /// Stops at the first empty slot or the first slot with the same hash.
    /// When culling, idle entries met along the way have their use count
    /// halved and are dropped once it reaches zero. If every probe hits a
    /// busy slot the last one is returned and the caller evicts it.
    fn insert_position(
        &mut self,
        hash: u32,
        cull: bool,
        now: u64,
    ) -> std::result::Result<Slot, Corruption> {
        let index_len = self.geo.index_len;
        let mut slot = self.geo.slot(i64::from(probe_position(hash, 0, index_len)))?;

        for probe in 1..MAX_PROBE_COUNT {
            let mut entry = self.entry(slot)?;
            if !entry.is_live() || entry.hash == hash {
                break;
            }
            if cull && now.saturating_sub(entry.last_used) > CULL_IDLE_NANOS {
                entry.use_count >>= 1;
                if entry.use_count == 0 {
                    debug!(slot = slot.get(), "culling idle colliding entry");
                    self.remove_entry(slot)?;
                    break;
                }
                self.set_entry(slot, &entry)?;
            }
            slot = self
                .geo
                .slot(i64::from(probe_position(hash, probe, index_len)))?;
        }

        Ok(slot)
    }

    /// Count an access to `slot`.
    fn touch(&mut self, slot: Slot) -> std::result::Result<IndexEntry, Corruption> {
        let mut entry = self.entry(slot)?;
        entry.use_count = entry.use_count.saturating_add(1);
        entry.last_used = now_nanos();
        self.set_entry(slot, &entry)?;
        Ok(entry)
    }
}

/// Wall-clock time in nanoseconds since the Unix epoch. Shared with other
/// processes, so a monotonic clock will not do.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub fn now_secs() -> u64 {
    now_nanos() / 1_000_000_000
}


#[cfg(test)]
mod tests {
    use super::test_support::{rng, TestRegion};
    use super::*;

    fn region() -> TestRegion {
        TestRegion::new(Geometry::new(1 << 20, 4096).unwrap())
    }

    fn accounting_holds(cache: &ShmCache<'_>) {
        let stats = cache.stats().unwrap();
        assert_eq!(stats.free_pages + stats.pages_owned, stats.page_count);
    }

    #[test]
    fn insert_then_lookup() {
        let mut region = region();
        let mut cache = region.cache();
        let mut rng = rng();
        cache.insert(b"hello", b"world", &mut rng).unwrap();
        assert_eq!(cache.lookup(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(cache.lookup(b"other").unwrap(), None);
        assert_eq!(cache.free_pages().unwrap(), 255);
        accounting_holds(&cache);
    }

    #[test]
    fn overwrite_keeps_one_entry() {
        let mut region = region();
        let mut cache = region.cache();
        let mut rng = rng();
        cache.insert(b"k", &[1; 5000], &mut rng).unwrap();
        cache.insert(b"k", b"second", &mut rng).unwrap();
        assert_eq!(cache.lookup(b"k").unwrap(), Some(b"second".to_vec()));
        let stats = cache.stats().unwrap();
        assert_eq!(stats.live_entries, 1);
        assert_eq!(stats.free_pages, 255);
        accounting_holds(&cache);
    }

    #[test]
    fn empty_value_removes_key() {
        let mut region = region();
        let mut cache = region.cache();
        let mut rng = rng();
        cache.insert(b"k", &[7; 9000], &mut rng).unwrap();
        assert_eq!(cache.free_pages().unwrap(), 253);
        cache.insert(b"k", b"", &mut rng).unwrap();
        assert!(!cache.contains(b"k").unwrap());
        assert_eq!(cache.free_pages().unwrap(), 256);
        // Removing a missing key through an empty insert is fine too.
        cache.insert(b"missing", b"", &mut rng).unwrap();
    }

    #[test]
    fn nul_in_key_is_rejected() {
        let mut region = region();
        let mut cache = region.cache();
        let mut rng = rng();
        assert!(matches!(
            cache.insert(b"a\0b", b"v", &mut rng),
            Err(CacheError::InvalidKey)
        ));
        assert_eq!(cache.stats().unwrap().live_entries, 0);
    }

    #[test]
    fn oversized_value_leaves_cache_unchanged() {
        let mut region = region();
        let mut cache = region.cache();
        let mut rng = rng();
        cache.insert(b"small", b"v", &mut rng).unwrap();
        let before = cache.stats().unwrap();

        // 256 pages would be the whole arena.
        let huge = vec![0u8; 255 * 4096];
        assert!(matches!(
            cache.insert(b"huge", &huge, &mut rng),
            Err(CacheError::TooLarge {
                pages: 256,
                page_count: 256,
                ..
            })
        ));
        assert_eq!(cache.stats().unwrap(), before);

        // One page short of the arena fits.
        let big = vec![0u8; 255 * 4096 - 5];
        cache.insert(b"big", &big, &mut rng).unwrap();
        assert_eq!(cache.lookup(b"big").unwrap().map(|v| v.len()), Some(big.len()));
    }

    #[test]
    fn lookup_counts_uses() {
        let mut region = region();
        let mut cache = region.cache();
        let mut rng = rng();
        cache.insert(b"k", b"v", &mut rng).unwrap();
        let slot = cache.find_entry(b"k").unwrap().unwrap();
        let added = cache.entry(slot).unwrap();
        assert_eq!(added.use_count, 1);
        assert_eq!(added.add_time, added.last_used);

        cache.lookup(b"k").unwrap();
        assert!(cache.contains(b"k").unwrap());
        let touched = cache.entry(slot).unwrap();
        assert_eq!(touched.use_count, 3);
        assert!(touched.last_used >= added.last_used);
        assert_eq!(touched.add_time, added.add_time);
    }

    #[test]
    fn colliding_insert_replaces_last_probe() {
        let mut region = region();
        let mut cache = region.cache();
        let mut rng = rng();
        cache.insert(b"victim", b"v", &mut rng).unwrap();
        let hash = hash_key(b"victim");
        let index_len = cache.geometry().index_len;

        // Occupy every probe position of "victim"'s hash with foreign entries.
        let first_probe = cache.find_entry(b"victim").unwrap().unwrap();
        assert_eq!(first_probe.get(), probe_position(hash, 0, index_len));
        cache.remove(b"victim").unwrap();
        for probe in 0..MAX_PROBE_COUNT {
            let slot = cache
                .geometry()
                .slot(i64::from(probe_position(hash, probe, index_len)))
                .unwrap();
            let page = cache.find_empty_pages(1).unwrap().unwrap();
            cache.set_page_owner(page, slot.get() as i32).unwrap();
            let free = cache.free_pages().unwrap();
            cache.set_free_pages(free - 1).unwrap();
            cache
                .set_entry(
                    slot,
                    &IndexEntry {
                        hash: hash.wrapping_add(1 + probe),
                        total_size: 10,
                        use_count: 5,
                        first_page: page.get() as i32,
                        add_time: now_nanos(),
                        last_used: now_nanos(),
                    },
                )
                .unwrap();
        }
        accounting_holds(&cache);

        cache.insert(b"victim", b"again", &mut rng).unwrap();
        let slot = cache.find_entry(b"victim").unwrap().unwrap();
        assert_eq!(
            slot.get(),
            probe_position(hash, MAX_PROBE_COUNT - 1, index_len)
        );
        assert_eq!(cache.stats().unwrap().live_entries, MAX_PROBE_COUNT);
        accounting_holds(&cache);
    }

    #[test]
    fn culling_drops_idle_collisions() {
        let mut region = region();
        let mut cache = region.cache();
        let hash = hash_key(b"newcomer");
        let index_len = cache.geometry().index_len;
        let home = cache
            .geometry()
            .slot(i64::from(probe_position(hash, 0, index_len)))
            .unwrap();

        // An entry idle since the epoch with use count 1 in the home slot.
        let page = cache.geometry().page(0).unwrap();
        cache.set_page_owner(page, home.get() as i32).unwrap();
        cache.set_free_pages(255).unwrap();
        cache
            .set_entry(
                home,
                &IndexEntry {
                    hash: hash ^ 1,
                    total_size: 4,
                    use_count: 1,
                    first_page: 0,
                    add_time: 0,
                    last_used: 0,
                },
            )
            .unwrap();

        let slot = cache.insert_position(hash, true, now_nanos()).unwrap();
        assert_eq!(slot, home);
        assert!(!cache.entry(home).unwrap().is_live());
        assert_eq!(cache.free_pages().unwrap(), 256);
    }

    #[test]
    fn culling_halves_busy_collisions() {
        let mut region = region();
        let mut cache = region.cache();
        let hash = hash_key(b"newcomer");
        let index_len = cache.geometry().index_len;
        let home = cache
            .geometry()
            .slot(i64::from(probe_position(hash, 0, index_len)))
            .unwrap();
        let page = cache.geometry().page(0).unwrap();
        cache.set_page_owner(page, home.get() as i32).unwrap();
        cache.set_free_pages(255).unwrap();
        cache
            .set_entry(
                home,
                &IndexEntry {
                    hash: hash ^ 1,
                    total_size: 4,
                    use_count: 8,
                    first_page: 0,
                    add_time: 0,
                    last_used: 0,
                },
            )
            .unwrap();

        let slot = cache.insert_position(hash, true, now_nanos()).unwrap();
        assert_ne!(slot, home);
        assert_eq!(cache.entry(home).unwrap().use_count, 4);

        // Without culling the idle entry is left alone.
        cache.insert_position(hash, false, now_nanos()).unwrap();
        assert_eq!(cache.entry(home).unwrap().use_count, 4);
    }

    #[test]
    fn cull_probability_tracks_load() {
        let mut region = region();
        let mut cache = region.cache();
        assert_eq!(cache.cull_probability().unwrap(), 0.0);
        cache.set_free_pages(128).unwrap();
        assert_eq!(cache.cull_probability().unwrap(), 0.0);
        cache.set_free_pages(0).unwrap();
        assert_eq!(cache.cull_probability().unwrap(), 1.0);
        // 75% full
        cache.set_free_pages(64).unwrap();
        let p = cache.cull_probability().unwrap();
        assert!(p > 0.5 && p < 0.6, "{p}");
    }

    #[test]
    fn full_cache_evicts_to_make_room() {
        let mut region = region();
        let mut cache = region.cache();
        let mut rng = rng();
        // Two pages each, 400 pages in total.
        for i in 0..200u32 {
            let key = format!("key-{i}");
            cache.insert(key.as_bytes(), &[i as u8; 5000], &mut rng).unwrap();
            accounting_holds(&cache);
        }
        assert!(cache.stats().unwrap().live_entries <= 128);
        assert_eq!(
            cache.lookup(b"key-199").unwrap(),
            Some(vec![199u8; 5000])
        );
    }

    #[test]
    fn clear_empties_everything() {
        let mut region = region();
        let mut cache = region.cache();
        let mut rng = rng();
        for i in 0..20u32 {
            cache
                .insert(format!("k{i}").as_bytes(), &[1; 2048], &mut rng)
                .unwrap();
        }
        cache.clear().unwrap();
        let stats = cache.stats().unwrap();
        assert_eq!(stats.free_pages, 256);
        assert_eq!(stats.live_entries, 0);
        assert_eq!(cache.lookup(b"k3").unwrap(), None);
    }

    #[test]
    fn attach_validates_header() {
        let mut region = region();
        region.bytes_mut()[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&3u32.to_ne_bytes());
        assert!(matches!(
            ShmCache::attach(Segment::new(region.bytes_mut())),
            Err(Corruption::BadVersion { found: 3, .. })
        ));

        let mut region = self::region();
        region.bytes_mut()[OFF_FREE_PAGES..OFF_FREE_PAGES + 4]
            .copy_from_slice(&257u32.to_ne_bytes());
        assert!(matches!(
            ShmCache::attach(Segment::new(region.bytes_mut())),
            Err(Corruption::FreeCountOverflow { free: 257, .. })
        ));

        let mut region = self::region();
        region.bytes_mut()[OFF_EVICTION_POLICY..OFF_EVICTION_POLICY + 4]
            .copy_from_slice(&9u32.to_ne_bytes());
        assert!(matches!(
            ShmCache::attach(Segment::new(region.bytes_mut())),
            Err(Corruption::BadEvictionPolicy(9))
        ));

        let mut region = self::region();
        region.bytes_mut()[OFF_CACHE_SIZE..OFF_CACHE_SIZE + 4]
            .copy_from_slice(&(2u32 << 20).to_ne_bytes());
        assert!(matches!(
            ShmCache::attach(Segment::new(region.bytes_mut())),
            Err(Corruption::SizeMismatch { .. })
        ));
    }

    #[test]
    fn lru_policy_evicts_least_recently_used() {
        let geo = Geometry::new(1 << 20, 4096).unwrap();
        let mut region = TestRegion::with_policy(geo, EvictionPolicy::LeastRecentlyUsed);
        let mut cache = region.cache();
        let mut rng = rng();
        // 8 entries of 32 pages fill the arena.
        for i in 0..8u32 {
            cache
                .insert(format!("k{i}").as_bytes(), &vec![i as u8; 32 * 4096 - 3], &mut rng)
                .unwrap();
        }
        assert_eq!(cache.free_pages().unwrap(), 0);
        // Touch all but k2; last_used is in ns so each touch is later.
        for i in (0..8u32).filter(|&i| i != 2) {
            std::thread::sleep(std::time::Duration::from_millis(2));
            assert!(cache.contains(format!("k{i}").as_bytes()).unwrap());
        }

        cache.insert(b"new", &[9; 100], &mut rng).unwrap();
        assert!(!cache.contains(b"k2").unwrap());
        assert!(cache.contains(b"k7").unwrap());
        assert!(cache.contains(b"new").unwrap());
    }
}
