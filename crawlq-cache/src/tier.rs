use async_trait::async_trait;
use serde::Serialize;

use crate::{CacheEntry, CacheError, Ttl};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub tier: String,
    pub entry_count: usize,
    pub total_bytes: u64,
    pub expired_count: usize,
}

/// One storage layer of the cache. Tiers never return expired entries.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch and touch an entry.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store `payload`. Returns `false` when it cannot fit within the bound.
    async fn set(&self, key: &str, payload: &[u8], ttl: Ttl) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    async fn stats(&self) -> Result<TierStats, CacheError>;

    /// Drop expired entries, returning how many were removed.
    async fn sweep_expired(&self) -> Result<usize, CacheError>;
}
