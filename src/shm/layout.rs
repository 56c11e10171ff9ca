//! Byte layout of the shared region.
//!
//! The region is a header followed by the index table, the page table and
//! the page arena. Nothing in it is a native pointer: every position is an
//! offset computed from the header fields, so each process can map the file
//! at a different address.
//!
//! ```text
//! +--------+-------------+------------+-------+-------+-----+
//! | Header | Index Table | Page Table | Page0 | Page1 | ... |
//! +--------+-------------+------------+-------+-------+-----+
//! ```
use crate::error::Corruption;

/// Bumped whenever the layout changes. Never reuse an old value.
pub const CACHE_VERSION: u32 = 12;

/// Size of the fixed header at the start of the region.
pub const HEADER_SIZE: usize = 128;

/// Smallest cache (in bytes) we are willing to create.
pub const MINIMUM_CACHE_SIZE: u32 = 4096;

/// Every cache holds at least this many pages.
pub const MINIMUM_PAGE_COUNT: u32 = 256;

pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 256 * 1024;
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Sentinel for "no page" in index entries and "free" in the page table.
pub const PAGE_NONE: i32 = -1;

// Header field offsets. `ready` must stay first: a freshly created file is
// all zeroes, which is what makes the first-writer protocol work.
pub const OFF_READY: usize = 0; // atomic u32
pub const OFF_VERSION: usize = 4; // u32
pub const OFF_TIMESTAMP: usize = 8; // atomic u64
pub const OFF_CACHE_SIZE: usize = 16; // u32
pub const OFF_PAGE_SIZE: usize = 20; // u32
pub const OFF_FREE_PAGES: usize = 24; // u32
pub const OFF_EVICTION_POLICY: usize = 28; // atomic u32
pub const OFF_LOCK_KIND: usize = 32; // u32
pub const OFF_LOCK_STORAGE: usize = 64; // LOCK_STORAGE_SIZE bytes

/// Inline storage reserved for the native lock primitive.
pub const LOCK_STORAGE_SIZE: usize = 64;

const _: () = assert!(OFF_LOCK_STORAGE + LOCK_STORAGE_SIZE == HEADER_SIZE);
const _: () = assert!(OFF_LOCK_STORAGE % 8 == 0);

/// Values of the readiness flag.
pub const READY_UNINITIALIZED: u32 = 0;
pub const READY_INITIALIZING: u32 = 1;
pub const READY_DONE: u32 = 2;

/// One index table entry.
///
/// Stored as 32 bytes:
///   0..4   hash
///   4..8   total_size (key + NUL + value)
///   8..12  use_count
///   12..16 first_page (PAGE_NONE = empty)
///   16..24 add_time   (ns since the Unix epoch)
///   24..32 last_used  (ns since the Unix epoch)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub hash: u32,
    pub total_size: u32,
    pub use_count: u32,
    pub first_page: i32,
    pub add_time: u64,
    pub last_used: u64,
}

impl IndexEntry {
    pub const SIZE: usize = 32;

    pub const EMPTY: IndexEntry = IndexEntry {
        hash: 0,
        total_size: 0,
        use_count: 0,
        first_page: PAGE_NONE,
        add_time: 0,
        last_used: 0,
    };

    #[inline]
    pub fn is_live(&self) -> bool {
        self.first_page >= 0
    }

    pub fn decode(b: &[u8; Self::SIZE]) -> Self {
        IndexEntry {
            hash: u32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
            total_size: u32::from_ne_bytes([b[4], b[5], b[6], b[7]]),
            use_count: u32::from_ne_bytes([b[8], b[9], b[10], b[11]]),
            first_page: i32::from_ne_bytes([b[12], b[13], b[14], b[15]]),
            add_time: u64::from_ne_bytes([
                b[16], b[17], b[18], b[19], b[20], b[21], b[22], b[23],
            ]),
            last_used: u64::from_ne_bytes([
                b[24], b[25], b[26], b[27], b[28], b[29], b[30], b[31],
            ]),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.hash.to_ne_bytes());
        b[4..8].copy_from_slice(&self.total_size.to_ne_bytes());
        b[8..12].copy_from_slice(&self.use_count.to_ne_bytes());
        b[12..16].copy_from_slice(&self.first_page.to_ne_bytes());
        b[16..24].copy_from_slice(&self.add_time.to_ne_bytes());
        b[24..32].copy_from_slice(&self.last_used.to_ne_bytes());
        b
    }
}

/// Page table entries are a single i32: the owning slot, or PAGE_NONE.
pub const PAGE_ENTRY_SIZE: usize = 4;

/// A slot number that has been checked against the index table length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(u32);

impl Slot {
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

/// A page number that has been checked against the page table length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(u32);

impl PageId {
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

/// Positions of every section, derived from the cache size and page size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub cache_size: u32,
    pub page_size: u32,
    pub page_count: u32,
    pub index_len: u32,
    pub index_offset: usize,
    pub page_table_offset: usize,
    pub data_offset: usize,
    pub total_size: usize,
}

impl Geometry {
    pub fn new(cache_size: u32, page_size: u32) -> Result<Self, Corruption> {
        let page_size = validate_page_size(page_size)?;
        let page_count = cache_size / page_size;
        // Average item assumed to take two pages.
        let index_len = page_count / 2;
        if index_len == 0 {
            return Err(Corruption::BadGeometry {
                cache_size,
                page_size,
            });
        }

        let index_offset = align_up(HEADER_SIZE, 8);
        let page_table_offset =
            align_up(index_offset + index_len as usize * IndexEntry::SIZE, PAGE_ENTRY_SIZE);
        let data_offset = align_up(page_table_offset + page_count as usize * PAGE_ENTRY_SIZE, 8);
        let total_size = data_offset + page_count as usize * page_size as usize;

        Ok(Geometry {
            cache_size,
            page_size,
            page_count,
            index_len,
            index_offset,
            page_table_offset,
            data_offset,
            total_size,
        })
    }

    /// Validate a raw slot number read from shared memory.
    #[inline]
    pub fn slot(&self, raw: i64) -> Result<Slot, Corruption> {
        if raw < 0 || raw >= self.index_len as i64 {
            return Err(Corruption::BadSlot {
                slot: raw,
                len: self.index_len,
            });
        }
        Ok(Slot(raw as u32))
    }

    /// Validate a raw page number read from shared memory.
    #[inline]
    pub fn page(&self, raw: i64) -> Result<PageId, Corruption> {
        if raw < 0 || raw >= self.page_count as i64 {
            return Err(Corruption::BadPage {
                page: raw,
                len: self.page_count,
            });
        }
        Ok(PageId(raw as u32))
    }

    #[inline]
    pub fn index_entry_offset(&self, slot: Slot) -> usize {
        self.index_offset + slot.0 as usize * IndexEntry::SIZE
    }

    #[inline]
    pub fn page_entry_offset(&self, page: PageId) -> usize {
        self.page_table_offset + page.0 as usize * PAGE_ENTRY_SIZE
    }

    #[inline]
    pub fn page_offset(&self, page: PageId) -> usize {
        self.data_offset + page.0 as usize * self.page_size as usize
    }

    /// Number of pages needed to hold `bytes`.
    pub fn pages_for(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.page_size as usize)
    }
}

/// Normalize the caller's capacity request the way a fresh region is sized.
///
/// Returns `(cache_size, page_size)`.
pub fn normalized_sizes(requested: usize, item_size_hint: usize) -> (u32, u32) {
    let page_size = page_size_for(item_size_hint);
    let requested = u32::try_from(requested).unwrap_or(u32::MAX);
    let floor = (page_size * MINIMUM_PAGE_COUNT).max(MINIMUM_CACHE_SIZE);
    let cache_size = requested.max(floor);
    (cache_size - cache_size % page_size, page_size)
}

/// Convert an average item size into a page size: the power of two at or
/// below the hint, clamped to [512 B, 256 KiB].
pub fn page_size_for(item_size_hint: usize) -> u32 {
    if item_size_hint == 0 {
        return DEFAULT_PAGE_SIZE;
    }
    let log2 = usize::BITS - 1 - item_size_hint.leading_zeros();
    let log2 = log2.clamp(MIN_PAGE_SIZE.trailing_zeros(), MAX_PAGE_SIZE.trailing_zeros());
    1 << log2
}

pub fn validate_page_size(page_size: u32) -> Result<u32, Corruption> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Corruption::BadPageSize(page_size));
    }
    Ok(page_size)
}

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_rounds_down_and_clamps() {
        assert_eq!(page_size_for(0), 4096);
        assert_eq!(page_size_for(1), 512);
        assert_eq!(page_size_for(600), 512);
        assert_eq!(page_size_for(1024), 1024);
        assert_eq!(page_size_for(3000), 2048);
        assert_eq!(page_size_for(10 << 20), 256 * 1024);
    }

    #[test]
    fn bad_page_sizes_are_corruption() {
        assert!(validate_page_size(4096).is_ok());
        assert_eq!(validate_page_size(0), Err(Corruption::BadPageSize(0)));
        assert_eq!(validate_page_size(3000), Err(Corruption::BadPageSize(3000)));
        assert_eq!(validate_page_size(256), Err(Corruption::BadPageSize(256)));
        assert!(validate_page_size(512 * 1024).is_err());
    }

    #[test]
    fn normalized_sizes_enforce_minimum_pages() {
        assert_eq!(normalized_sizes(1 << 20, 4096), (1 << 20, 4096));
        // 256 pages minimum
        assert_eq!(normalized_sizes(10_000, 4096), (4096 * 256, 4096));
        // rounded down to whole pages
        assert_eq!(normalized_sizes(300 * 512 + 17, 512), (300 * 512, 512));
    }

    #[test]
    fn geometry_sections_are_aligned_and_ordered() {
        let geo = Geometry::new(1 << 20, 4096).unwrap();
        assert_eq!(geo.page_count, 256);
        assert_eq!(geo.index_len, 128);
        assert_eq!(geo.index_offset, HEADER_SIZE);
        assert_eq!(geo.page_table_offset, HEADER_SIZE + 128 * IndexEntry::SIZE);
        assert_eq!(geo.data_offset % 8, 0);
        assert!(geo.data_offset >= geo.page_table_offset + 256 * PAGE_ENTRY_SIZE);
        assert_eq!(geo.total_size, geo.data_offset + 256 * 4096);
    }

    #[test]
    fn geometry_rejects_tiny_caches() {
        assert!(matches!(
            Geometry::new(4096, 4096),
            Err(Corruption::BadGeometry { .. })
        ));
    }

    #[test]
    fn slot_and_page_ids_are_range_checked() {
        let geo = Geometry::new(1 << 20, 4096).unwrap();
        assert_eq!(geo.slot(127).unwrap().get(), 127);
        assert!(geo.slot(128).is_err());
        assert!(geo.slot(-1).is_err());
        assert_eq!(geo.page(255).unwrap().get(), 255);
        assert!(geo.page(256).is_err());
        assert!(geo.page(i64::from(i32::MIN)).is_err());
    }

    #[test]
    fn index_entry_encoding_is_stable() {
        let e = IndexEntry {
            hash: 0xDEAD_BEEF,
            total_size: 77,
            use_count: 3,
            first_page: 9,
            add_time: 1,
            last_used: u64::MAX,
        };
        let bytes = e.encode();
        assert_eq!(&bytes[0..4], &0xDEAD_BEEFu32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &9i32.to_ne_bytes());
        assert_eq!(IndexEntry::decode(&bytes), e);
        assert!(!IndexEntry::EMPTY.is_live());
    }
}
