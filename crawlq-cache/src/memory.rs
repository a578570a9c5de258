//! Process-local tier bounded by entry count and total payload bytes.
use async_trait::async_trait;
use chrono::Utc;
use crawlq_config::{CacheSettings, MemoryCacheSettings};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::entry::eviction_batch;
use crate::{CacheEntry, CacheError, CacheTier, TierStats, Ttl};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTierOptions {
    pub max_entries: usize,
    pub max_bytes: Option<u64>,
    pub eviction_fraction: f64,
    pub default_ttl: Option<Duration>,
}

impl MemoryTierOptions {
    pub fn from_settings(cache: &CacheSettings) -> Self {
        let memory: &MemoryCacheSettings = &cache.memory;
        Self {
            max_entries: memory.max_entries,
            max_bytes: (memory.max_memory_mb > 0).then(|| memory.max_memory_mb * 1024 * 1024),
            eviction_fraction: memory.eviction_fraction,
            default_ttl: Some(cache.default_ttl()),
        }
    }
}

impl Default for MemoryTierOptions {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default())
    }
}

#[derive(Debug)]
pub struct MemoryTier {
    entries: Mutex<HashMap<String, CacheEntry>>,
    options: MemoryTierOptions,
}

impl MemoryTier {
    pub fn new(options: MemoryTierOptions) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            options,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CacheEntry>>, CacheError> {
        self.entries
            .lock()
            .map_err(|e| CacheError::Poisoned(e.to_string()))
    }

    fn fits(&self, entries: &HashMap<String, CacheEntry>, size: u64) -> bool {
        let total: u64 = entries.values().map(|e| e.size).sum();
        entries.len() < self.options.max_entries
            && self.options.max_bytes.map_or(true, |max| total + size <= max)
    }

    /// Remove the least valuable batch of entries.
    fn evict(&self, entries: &mut HashMap<String, CacheEntry>) -> usize {
        let mut ranked: Vec<(u64, chrono::DateTime<Utc>, String)> = entries
            .values()
            .map(|e| (e.access_count, e.last_access, e.key.clone()))
            .collect();
        ranked.sort();
        let batch = eviction_batch(ranked.len(), self.options.eviction_fraction);
        for (_, _, key) in ranked.into_iter().take(batch) {
            entries.remove(&key);
        }
        batch
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = Utc::now();
        let mut entries = self.lock()?;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get_mut(key).map(|entry| {
            entry.touch(now);
            entry.clone()
        }))
    }

    async fn set(&self, key: &str, payload: &[u8], ttl: Ttl) -> Result<bool, CacheError> {
        let size = payload.len() as u64;
        if self.options.max_entries == 0
            || self.options.max_bytes.is_some_and(|max| size > max)
        {
            return Ok(false);
        }

        let now = Utc::now();
        let entry = CacheEntry::new(
            key,
            payload.to_vec(),
            ttl.expires_at(now, self.options.default_ttl),
        );

        let mut entries = self.lock()?;
        entries.remove(key);
        let mut evicted = 0;
        while !self.fits(&entries, size) {
            evicted += self.evict(&mut entries);
        }
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted memory cache entries");
        }
        entries.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.lock()?.clear();
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let now = Utc::now();
        let mut entries = self.lock()?;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            return Ok(false);
        }
        Ok(entries.contains_key(key))
    }

    async fn stats(&self) -> Result<TierStats, CacheError> {
        let now = Utc::now();
        let entries = self.lock()?;
        Ok(TierStats {
            tier: self.name().to_string(),
            entry_count: entries.len(),
            total_bytes: entries.values().map(|e| e.size).sum(),
            expired_count: entries.values().filter(|e| e.is_expired(now)).count(),
        })
    }

    async fn sweep_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(max_entries: usize, max_bytes: Option<u64>) -> MemoryTier {
        MemoryTier::new(MemoryTierOptions {
            max_entries,
            max_bytes,
            eviction_fraction: 0.1,
            default_ttl: Some(Duration::from_secs(3600)),
        })
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let tier = tier(10, None);
        assert!(tier.set("a", b"alpha", Ttl::Default).await.unwrap());
        let entry = tier.get("a").await.unwrap().unwrap();
        assert_eq!(entry.payload, b"alpha");
        assert_eq!(entry.size, 5);
        assert_eq!(entry.access_count, 1);
        assert!(entry.expires_at.is_some());

        assert!(tier.exists("a").await.unwrap());
        assert!(tier.delete("a").await.unwrap());
        assert!(!tier.delete("a").await.unwrap());
        assert!(tier.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_never_returned() {
        let tier = tier(10, None);
        tier.set("short", b"x", Ttl::After(Duration::from_millis(5)))
            .await
            .unwrap();
        tier.set("long", b"y", Ttl::Never).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(tier.stats().await.unwrap().expired_count, 1);
        assert!(tier.get("short").await.unwrap().is_none());
        assert!(!tier.exists("short").await.unwrap());
        assert!(tier.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_entry_bound_evicts_least_used() {
        let tier = tier(3, None);
        for key in ["a", "b", "c"] {
            tier.set(key, b"v", Ttl::Default).await.unwrap();
        }
        tier.get("a").await.unwrap();
        tier.get("c").await.unwrap();

        tier.set("d", b"v", Ttl::Default).await.unwrap();
        let stats = tier.stats().await.unwrap();
        assert_eq!(stats.entry_count, 3);
        assert!(tier.get("b").await.unwrap().is_none());
        assert!(tier.exists("a").await.unwrap());
        assert!(tier.exists("d").await.unwrap());
    }

    #[tokio::test]
    async fn test_byte_bound() {
        let tier = tier(100, Some(10));
        tier.set("a", &[0; 4], Ttl::Default).await.unwrap();
        tier.set("b", &[0; 4], Ttl::Default).await.unwrap();
        tier.set("c", &[0; 4], Ttl::Default).await.unwrap();
        assert!(tier.stats().await.unwrap().total_bytes <= 10);

        assert!(!tier.set("huge", &[0; 11], Ttl::Default).await.unwrap());
        assert!(!tier.exists("huge").await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let tier = tier(2, None);
        tier.set("a", b"1", Ttl::Default).await.unwrap();
        tier.set("b", b"2", Ttl::Default).await.unwrap();
        tier.set("a", b"3", Ttl::Default).await.unwrap();
        assert_eq!(tier.get("a").await.unwrap().unwrap().payload, b"3");
        assert!(tier.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_and_clear() {
        let tier = tier(10, None);
        tier.set("gone", b"x", Ttl::After(Duration::ZERO)).await.unwrap();
        tier.set("kept", b"y", Ttl::Default).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(tier.sweep_expired().await.unwrap(), 1);
        assert_eq!(tier.stats().await.unwrap().entry_count, 1);

        tier.clear().await.unwrap();
        assert_eq!(tier.stats().await.unwrap().entry_count, 0);
    }
}
