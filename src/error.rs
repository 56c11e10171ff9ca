//! Error types for the shared data cache.

use std::io;

use thiserror::Error;

/// A structural invariant of the shared region was found violated.
///
/// Raised anywhere below the façade and caught only there, where it turns
/// into delete-and-recreate recovery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    #[error("cache version {found} does not match expected {expected}")]
    BadVersion { found: u32, expected: u32 },

    #[error("invalid page size {0}")]
    BadPageSize(u32),

    #[error("cache of {cache_size} bytes with {page_size}-byte pages has no usable geometry")]
    BadGeometry { cache_size: u32, page_size: u32 },

    #[error("mapped {mapped} bytes but header describes {expected} bytes")]
    SizeMismatch { mapped: usize, expected: usize },

    #[error("unknown eviction policy {0}")]
    BadEvictionPolicy(u32),

    #[error("access of {len} bytes at offset {offset} is outside the {mapped}-byte region")]
    OutOfBounds {
        offset: usize,
        len: usize,
        mapped: usize,
    },

    #[error("misaligned atomic access at offset {0}")]
    Misaligned(usize),

    #[error("index slot {slot} out of range (table holds {len})")]
    BadSlot { slot: i64, len: u32 },

    #[error("page {page} out of range (table holds {len})")]
    BadPage { page: i64, len: u32 },

    #[error("free page count {free} exceeds page count {total}")]
    FreeCountOverflow { free: u32, total: u32 },

    #[error("free page count {free} cannot cover {needed} allocated pages")]
    FreeCountUnderflow { free: u32, needed: u32 },

    #[error("removing slot {slot}: reclaimed {reclaimed} pages, expected {expected}")]
    PageAccounting {
        slot: u32,
        reclaimed: u32,
        expected: u32,
    },

    #[error("page {page} does not link back to slot {slot}")]
    BrokenLink { slot: u32, page: i64 },

    #[error("entry in slot {0} is already empty")]
    EmptyEntry(u32),

    #[error("stored item size {0} is inconsistent")]
    BadItemSize(u32),

    #[error("asked to evict {requested} pages from a cache of {total}")]
    BadEvictionRequest { requested: u32, total: u32 },

    #[error("lock kind {found} in header, expected {expected}")]
    LockKindMismatch { found: u32, expected: u32 },

    #[error("lock kind {0} is not supported on this platform")]
    UnsupportedLock(u32),

    #[error("timed out waiting for the cache lock")]
    LockTimeout,

    #[error("previous lock owner died while holding the cache lock")]
    LockOwnerDied,

    #[error("lock operation failed with OS error {0}")]
    LockFailed(i32),

    #[error("timed out waiting for another process to initialize the cache")]
    InitTimeout,
}

/// Errors reported by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache is corrupt: {0}")]
    Corrupted(#[from] Corruption),

    #[error("item of {size} bytes needs {pages} pages, cache holds {page_count}")]
    TooLarge {
        size: usize,
        pages: u32,
        page_count: u32,
    },

    #[error("keys must not contain NUL bytes")]
    InvalidKey,

    #[error("unable to free {0} pages for the item")]
    NoSpace(u32),

    #[error("cache is detached from its memory region")]
    Detached,

    #[error("no usable lock primitive: {0}")]
    LockUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Whether this error should trigger delete-and-recreate recovery.
    pub fn is_corruption(&self) -> bool {
        matches!(self, CacheError::Corrupted(_))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
