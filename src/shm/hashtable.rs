//! Key hashing and slot lookup in the index table.
//!
//! The index table uses open addressing with quadratic probing. A lookup
//! visits the home slot and then at most `MAX_PROBE_COUNT - 1` further
//! positions; removed entries leave holes, so a miss at one position never
//! ends the search early.
use xxhash_rust::xxh32::xxh32;

use super::layout::{IndexEntry, Slot};
use super::ShmCache;
use crate::error::Corruption;

/// Fixed seed so every process derives the same hash for a key.
pub const HASH_SEED: u32 = 0xF0F0_0F0F;

/// Positions tried per key, including the home slot.
pub const MAX_PROBE_COUNT: u32 = 6;

#[inline]
pub fn hash_key(key: &[u8]) -> u32 {
    xxh32(key, HASH_SEED)
}

/// Index position for probe number `probe` (0 is the home slot).
///
/// position = (hash + (i + i²) / 2) mod index_len
#[inline]
pub fn probe_position(hash: u32, probe: u32, index_len: u32) -> u32 {
    let probe = u64::from(probe);
    let offset = (probe + probe * probe) / 2;
    ((u64::from(hash) + offset) % u64::from(index_len)) as u32
}

impl ShmCache<'_> {
    /// Find the live slot holding `key`.
    ///
    /// Compares the stored `key + NUL` prefix so colliding hashes never
    /// return the wrong entry.
    pub fn find_entry(&self, key: &[u8]) -> Result<Option<Slot>, Corruption> {
        let hash = hash_key(key);
        let index_len = self.geo.index_len;

        for probe in 0..MAX_PROBE_COUNT {
            let slot = self
                .geo
                .slot(i64::from(probe_position(hash, probe, index_len)))?;
            let entry = self.entry(slot)?;
            if entry.is_live() && entry.hash == hash && self.stored_key_matches(&entry, key)? {
                return Ok(Some(slot));
            }
        }

        Ok(None)
    }

    fn stored_key_matches(&self, entry: &IndexEntry, key: &[u8]) -> Result<bool, Corruption> {
        let prefix_len = key.len() + 1;
        if (entry.total_size as usize) < prefix_len {
            return Ok(false);
        }
        let page = self.geo.page(i64::from(entry.first_page))?;
        let stored = self.seg.bytes(self.geo.page_offset(page), prefix_len)?;
        Ok(&stored[..key.len()] == key && stored[key.len()] == 0)
    }
}
