//! A named, fixed-capacity byte cache shared between processes through one
//! memory-mapped file.
//!
//! ```no_run
//! use shared_data_cache::SharedDataCache;
//!
//! let cache = SharedDataCache::open("thumbnails", 10 << 20, 8192);
//! cache.insert("logo.png", b"...png bytes...");
//! assert!(cache.contains("logo.png"));
//! ```
mod cache;
mod config;
mod error;
pub mod shm;

pub use cache::{CacheState, SharedDataCache};
pub use config::{CacheConfig, FILE_EXTENSION};
pub use error::{CacheError, Corruption, Result};
pub use shm::lock::LockKind;
pub use shm::ordering::EvictionPolicy;
pub use shm::CacheStats;
