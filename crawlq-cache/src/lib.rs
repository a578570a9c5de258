//! Multi-tier response cache for crawlq.
//!
//! A `CacheManager` layers a bounded in-memory tier over a persistent disk
//! tier, depending on the configured `CacheStrategy`. Hits in the slower tier
//! are promoted into the faster one with their remaining lifetime.

mod disk;
mod entry;
mod error;
mod manager;
mod memory;
mod tier;

pub use disk::{DiskTier, DiskTierOptions};
pub use entry::{CacheEntry, Ttl};
pub use error::CacheError;
pub use manager::{CacheManager, CacheStats};
pub use memory::{MemoryTier, MemoryTierOptions};
pub use tier::{CacheTier, TierStats};

pub use crawlq_config::CacheStrategy;
