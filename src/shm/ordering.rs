//! Eviction order.
//!
//! Eviction snapshots the index table, sorts it by the configured policy and
//! removes entries from the front until enough pages are free.
use std::cmp::Ordering;

use tracing::debug;

use super::layout::{IndexEntry, PageId};
use super::ShmCache;
use crate::error::Corruption;

/// Which entries go first when the cache needs room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EvictionPolicy {
    /// Oldest last access first.
    LeastRecentlyUsed = 1,
    /// Lowest use count first.
    #[default]
    LeastOftenUsed = 2,
    /// Earliest insertion first.
    Oldest = 3,
}

/// Header value for "no preference"; read back as least-often-used.
pub const NO_EVICTION_PREFERENCE: u32 = 0;

impl EvictionPolicy {
    pub fn from_raw(raw: u32) -> Result<Self, Corruption> {
        match raw {
            1 => Ok(EvictionPolicy::LeastRecentlyUsed),
            NO_EVICTION_PREFERENCE | 2 => Ok(EvictionPolicy::LeastOftenUsed),
            3 => Ok(EvictionPolicy::Oldest),
            other => Err(Corruption::BadEvictionPolicy(other)),
        }
    }

    #[inline]
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// `Less` means `a` is evicted before `b`. Empty slots sort last.
    pub fn compare(self, a: &IndexEntry, b: &IndexEntry) -> Ordering {
        match (a.is_live(), b.is_live()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => Ordering::Equal,
            (true, true) => match self {
                EvictionPolicy::LeastRecentlyUsed => a.last_used.cmp(&b.last_used),
                EvictionPolicy::LeastOftenUsed => a.use_count.cmp(&b.use_count),
                EvictionPolicy::Oldest => a.add_time.cmp(&b.add_time),
            },
        }
    }
}

impl ShmCache<'_> {
    /// Free enough pages for a run of `count`, removing entries in policy
    /// order.
    ///
    /// Removes more than strictly needed so the next few inserts do not
    /// immediately evict again.
    pub fn evict(&mut self, count: u32) -> Result<Option<PageId>, Corruption> {
        let page_count = self.geo.page_count;
        if count == 0 || count > page_count {
            return Err(Corruption::BadEvictionRequest {
                requested: count,
                total: page_count,
            });
        }

        let free = self.free_pages()?;
        if free > 3 * count {
            self.defragment()?;
            if let Some(first) = self.find_empty_pages(count)? {
                return Ok(Some(first));
            }
        }

        let policy = self.eviction_policy()?;
        let mut candidates = Vec::with_capacity(self.geo.index_len as usize);
        for raw in 0..self.geo.index_len {
            let slot = self.geo.slot(i64::from(raw))?;
            candidates.push((slot, self.entry(slot)?));
        }
        // Stable, so ties keep index order.
        candidates.sort_by(|(_, a), (_, b)| policy.compare(a, b));
        let mut candidates = candidates
            .into_iter()
            .take_while(|(_, entry)| entry.is_live())
            .map(|(slot, _)| slot);

        let target = (6 * (count / 2).max(1)).min(page_count);
        debug!(
            requested = count,
            free_pages = free,
            target,
            ?policy,
            "evicting shared cache entries"
        );

        while self.free_pages()? < target {
            match candidates.next() {
                Some(slot) => self.remove_entry(slot)?,
                None => break,
            }
        }

        self.defragment()?;
        loop {
            if let Some(first) = self.find_empty_pages(count)? {
                return Ok(Some(first));
            }
            match candidates.next() {
                Some(slot) => {
                    self.remove_entry(slot)?;
                    self.defragment()?;
                }
                None => return Ok(None),
            }
        }
    }
}
