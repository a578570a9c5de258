use chrono::Utc;
use crawlq_config::{CacheSettings, CacheStrategy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    CacheError, CacheTier, DiskTier, DiskTierOptions, MemoryTier, MemoryTierOptions, TierStats,
    Ttl,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub strategy: CacheStrategy,
    pub tiers: Vec<TierStats>,
}

/// Layers tiers fastest first. Tier errors are logged and treated as misses.
#[derive(Clone)]
pub struct CacheManager {
    strategy: CacheStrategy,
    tiers: Vec<Arc<dyn CacheTier>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("strategy", &self.strategy)
            .field("tiers", &self.tiers.iter().map(|t| t.name()).collect::<Vec<_>>())
            .finish()
    }
}

fn absorb<T>(tier: &dyn CacheTier, op: &str, result: Result<T, CacheError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!(tier = tier.name(), op, error = %e, "Cache tier failure");
            None
        }
    }
}

impl CacheManager {
    pub fn new(strategy: CacheStrategy, tiers: Vec<Arc<dyn CacheTier>>) -> Self {
        Self { strategy, tiers }
    }

    /// Build the tier layout for the configured strategy.
    pub async fn from_settings(settings: &CacheSettings) -> Result<Self, CacheError> {
        let mut tiers: Vec<Arc<dyn CacheTier>> = Vec::new();
        if settings.strategy.uses_memory() {
            tiers.push(Arc::new(MemoryTier::new(MemoryTierOptions::from_settings(
                settings,
            ))));
        }
        if settings.strategy.uses_disk() {
            tiers.push(Arc::new(
                DiskTier::open(DiskTierOptions::from_settings(settings)).await?,
            ));
        }
        Ok(Self::new(settings.strategy, tiers))
    }

    pub fn strategy(&self) -> CacheStrategy {
        self.strategy
    }

    /// Deterministic key: md5 over the url and the sorted parameters.
    pub fn generate_key(url: &str, params: Option<&BTreeMap<String, serde_json::Value>>) -> String {
        let mut key = url.to_string();
        if let Some(params) = params.filter(|p| !p.is_empty()) {
            let pairs: Vec<(&String, &serde_json::Value)> = params.iter().collect();
            let encoded = serde_json::to_string(&pairs).unwrap_or_default();
            key.push('|');
            key.push_str(&encoded);
        }
        format!("{:x}", md5::compute(key.as_bytes()))
    }

    /// Look through tiers in order. A hit in a slower tier is copied into
    /// every faster tier with its remaining lifetime.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        for (depth, tier) in self.tiers.iter().enumerate() {
            let Some(Some(entry)) = absorb(tier.as_ref(), "get", tier.get(key).await) else {
                continue;
            };
            let ttl = entry.remaining_ttl(Utc::now());
            for faster in &self.tiers[..depth] {
                absorb(faster.as_ref(), "promote", faster.set(key, &entry.payload, ttl).await);
            }
            if depth > 0 {
                tracing::debug!(key, from = tier.name(), "Promoted cache entry");
            }
            return Some(entry.payload);
        }
        None
    }

    /// Write to every tier. `None` ttl uses each tier's default.
    pub async fn set(&self, key: &str, payload: &[u8], ttl: Option<Duration>) -> bool {
        let ttl = Ttl::from(ttl);
        let mut stored = !self.tiers.is_empty();
        for tier in &self.tiers {
            stored &= absorb(tier.as_ref(), "set", tier.set(key, payload, ttl).await)
                .unwrap_or(false);
        }
        stored
    }

    /// `true` when any tier held the key.
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = false;
        for tier in &self.tiers {
            removed |= absorb(tier.as_ref(), "delete", tier.delete(key).await).unwrap_or(false);
        }
        removed
    }

    pub async fn clear(&self) -> bool {
        let mut cleared = true;
        for tier in &self.tiers {
            cleared &= absorb(tier.as_ref(), "clear", tier.clear().await).is_some();
        }
        cleared
    }

    pub async fn exists(&self, key: &str) -> bool {
        for tier in &self.tiers {
            if absorb(tier.as_ref(), "exists", tier.exists(key).await).unwrap_or(false) {
                return true;
            }
        }
        false
    }

    pub async fn stats(&self) -> CacheStats {
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            if let Some(stats) = absorb(tier.as_ref(), "stats", tier.stats().await) {
                tiers.push(stats);
            }
        }
        CacheStats {
            strategy: self.strategy,
            tiers,
        }
    }

    pub async fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        for tier in &self.tiers {
            removed += absorb(tier.as_ref(), "sweep", tier.sweep_expired().await).unwrap_or(0);
        }
        if removed > 0 {
            tracing::debug!(removed, "Swept expired cache entries");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheEntry;
    use async_trait::async_trait;
    use crawlq_config::DiskCacheSettings;
    use tempfile::TempDir;

    /// Tier whose every operation fails.
    struct BrokenTier;

    #[async_trait]
    impl CacheTier for BrokenTier {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _: &str) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Poisoned("down".into()))
        }
        async fn set(&self, _: &str, _: &[u8], _: Ttl) -> Result<bool, CacheError> {
            Err(CacheError::Poisoned("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, CacheError> {
            Err(CacheError::Poisoned("down".into()))
        }
        async fn clear(&self) -> Result<(), CacheError> {
            Err(CacheError::Poisoned("down".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, CacheError> {
            Err(CacheError::Poisoned("down".into()))
        }
        async fn stats(&self) -> Result<TierStats, CacheError> {
            Err(CacheError::Poisoned("down".into()))
        }
        async fn sweep_expired(&self) -> Result<usize, CacheError> {
            Err(CacheError::Poisoned("down".into()))
        }
    }

    fn settings(dir: &TempDir, strategy: CacheStrategy) -> CacheSettings {
        CacheSettings {
            strategy,
            disk: DiskCacheSettings {
                directory: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_key_is_deterministic() {
        let mut a = BTreeMap::new();
        a.insert("page".to_string(), serde_json::json!(2));
        a.insert("lang".to_string(), serde_json::json!("sv"));
        let mut b = BTreeMap::new();
        b.insert("lang".to_string(), serde_json::json!("sv"));
        b.insert("page".to_string(), serde_json::json!(2));

        let url = "https://example.com/list";
        let key = CacheManager::generate_key(url, Some(&a));
        assert_eq!(key, CacheManager::generate_key(url, Some(&b)));
        assert_eq!(key.len(), 32);
        assert_ne!(key, CacheManager::generate_key(url, None));
        assert_eq!(
            CacheManager::generate_key(url, None),
            CacheManager::generate_key(url, Some(&BTreeMap::new()))
        );
    }

    #[tokio::test]
    async fn test_hybrid_promotes_disk_hits() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir, CacheStrategy::Hybrid);
        let memory = Arc::new(MemoryTier::new(MemoryTierOptions::from_settings(&settings)));
        let disk = Arc::new(DiskTier::open(DiskTierOptions::from_settings(&settings)).await.unwrap());
        disk.set("k", b"payload", Ttl::After(Duration::from_secs(60)))
            .await
            .unwrap();

        let cache = CacheManager::new(
            CacheStrategy::Hybrid,
            vec![memory.clone() as Arc<dyn CacheTier>, disk],
        );
        assert_eq!(cache.get("k").await, Some(b"payload".to_vec()));

        let promoted = memory.get("k").await.unwrap().unwrap();
        let remaining = promoted.expires_at.unwrap() - Utc::now();
        assert!(remaining <= chrono::Duration::seconds(60));
        assert!(remaining > chrono::Duration::seconds(50));
    }

    #[tokio::test]
    async fn test_set_writes_every_tier() {
        let dir = TempDir::new().unwrap();
        let cache = CacheManager::from_settings(&settings(&dir, CacheStrategy::Hybrid))
            .await
            .unwrap();
        assert!(cache.set("k", b"v", None).await);
        assert!(cache.exists("k").await);

        let stats = cache.stats().await;
        assert_eq!(stats.strategy, CacheStrategy::Hybrid);
        assert_eq!(stats.tiers.len(), 2);
        assert!(stats.tiers.iter().all(|t| t.entry_count == 1));

        assert!(cache.delete("k").await);
        assert!(!cache.exists("k").await);
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_strategy_layouts() {
        let dir = TempDir::new().unwrap();
        let memory = CacheManager::from_settings(&settings(&dir, CacheStrategy::Memory))
            .await
            .unwrap();
        assert_eq!(memory.stats().await.tiers[0].tier, "memory");
        assert_eq!(memory.stats().await.tiers.len(), 1);

        let disk = CacheManager::from_settings(&settings(&dir, CacheStrategy::Disk))
            .await
            .unwrap();
        assert_eq!(disk.stats().await.tiers[0].tier, "disk");
    }

    #[tokio::test]
    async fn test_failing_tier_is_absorbed() {
        let memory = Arc::new(MemoryTier::new(MemoryTierOptions::default()));
        let cache = CacheManager::new(
            CacheStrategy::Hybrid,
            vec![Arc::new(BrokenTier) as Arc<dyn CacheTier>, memory],
        );

        assert!(!cache.set("k", b"v", None).await);
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));
        assert!(cache.exists("k").await);
        assert_eq!(cache.stats().await.tiers.len(), 1);
        assert!(!cache.clear().await);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let dir = TempDir::new().unwrap();
        let cache = CacheManager::from_settings(&settings(&dir, CacheStrategy::Hybrid))
            .await
            .unwrap();
        cache.set("short", b"v", Some(Duration::from_millis(1))).await;
        cache.set("long", b"v", None).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.sweep_expired().await, 2);
        assert!(cache.get("short").await.is_none());
        assert!(cache.get("long").await.is_some());
    }
}
