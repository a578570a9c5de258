//! Persistent tier: one blob file per key plus an `index.json` that survives
//! restarts.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawlq_config::CacheSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};

use crate::entry::eviction_batch;
use crate::{CacheEntry, CacheError, CacheTier, TierStats, Ttl};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq)]
pub struct DiskTierOptions {
    pub directory: PathBuf,
    pub max_bytes: u64,
    pub eviction_fraction: f64,
    pub default_ttl: Option<Duration>,
}

impl DiskTierOptions {
    pub fn from_settings(cache: &CacheSettings) -> Self {
        let disk = &cache.disk;
        Self {
            directory: disk.directory.clone(),
            max_bytes: disk.max_size_mb * 1024 * 1024,
            eviction_fraction: disk.eviction_fraction,
            default_ttl: Some(
                disk.default_ttl_s
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| cache.default_ttl()),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexRecord {
    file_path: PathBuf,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    access_count: u64,
    last_access: DateTime<Utc>,
    size: u64,
}

impl IndexRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

#[derive(Debug, Default)]
struct DiskState {
    index: HashMap<String, IndexRecord>,
    /// Access counters changed since the last index write.
    dirty: bool,
}

impl DiskState {
    fn total_bytes(&self) -> u64 {
        self.index.values().map(|r| r.size).sum()
    }
}

#[derive(Debug)]
pub struct DiskTier {
    options: DiskTierOptions,
    state: Mutex<DiskState>,
}

impl DiskTier {
    /// Create the directory if needed and load the index. A corrupted index
    /// is discarded.
    pub async fn open(options: DiskTierOptions) -> Result<Self, CacheError> {
        fs::create_dir_all(&options.directory).await?;
        let index = load_index(&options.directory.join(INDEX_FILE)).await?;
        tracing::debug!(
            directory = %options.directory.display(),
            entries = index.len(),
            "Opened disk cache"
        );
        Ok(Self {
            options,
            state: Mutex::new(DiskState {
                index,
                dirty: false,
            }),
        })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.options
            .directory
            .join(format!("{:x}.cache", md5::compute(key.as_bytes())))
    }

    async fn save_index(&self, state: &mut MutexGuard<'_, DiskState>) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(&state.index)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        let path = self.options.directory.join(INDEX_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        state.dirty = false;
        Ok(())
    }

    /// Persist pending access counter updates.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        if state.dirty {
            self.save_index(&mut state).await?;
        }
        Ok(())
    }

    async fn remove_blob(path: &Path) -> Result<(), CacheError> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn remove_locked(
        &self,
        state: &mut MutexGuard<'_, DiskState>,
        key: &str,
    ) -> Result<bool, CacheError> {
        match state.index.remove(key) {
            Some(record) => {
                Self::remove_blob(&record.file_path).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn evict_locked(
        &self,
        state: &mut MutexGuard<'_, DiskState>,
    ) -> Result<usize, CacheError> {
        let mut ranked: Vec<(u64, DateTime<Utc>, String)> = state
            .index
            .iter()
            .map(|(key, r)| (r.access_count, r.last_access, key.clone()))
            .collect();
        ranked.sort();
        let batch = eviction_batch(ranked.len(), self.options.eviction_fraction);
        for (_, _, key) in ranked.into_iter().take(batch) {
            self.remove_locked(state, &key).await?;
        }
        Ok(batch)
    }
}

async fn load_index(path: &Path) -> Result<HashMap<String, IndexRecord>, CacheError> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&raw) {
        Ok(index) => Ok(index),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Corrupted cache index, starting empty");
            Ok(HashMap::new())
        }
    }
}

#[async_trait]
impl CacheTier for DiskTier {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(record) = state.index.get(key).cloned() else {
            return Ok(None);
        };
        if record.is_expired(now) {
            self.remove_locked(&mut state, key).await?;
            self.save_index(&mut state).await?;
            return Ok(None);
        }

        let payload = match fs::read(&record.file_path).await {
            Ok(payload) => payload,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(key, "Cache blob missing, dropping index entry");
                state.index.remove(key);
                self.save_index(&mut state).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let record = match state.index.get_mut(key) {
            Some(record) => {
                record.access_count += 1;
                record.last_access = now;
                record.clone()
            }
            None => return Ok(None),
        };
        state.dirty = true;

        Ok(Some(CacheEntry {
            key: key.to_string(),
            payload,
            size: record.size,
            created_at: record.created_at,
            expires_at: record.expires_at,
            access_count: record.access_count,
            last_access: record.last_access,
        }))
    }

    async fn set(&self, key: &str, payload: &[u8], ttl: Ttl) -> Result<bool, CacheError> {
        let size = payload.len() as u64;
        if size > self.options.max_bytes {
            return Ok(false);
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;
        self.remove_locked(&mut state, key).await?;
        let mut evicted = 0;
        while state.total_bytes() + size > self.options.max_bytes {
            evicted += self.evict_locked(&mut state).await?;
        }
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted disk cache entries");
        }

        let file_path = self.blob_path(key);
        fs::write(&file_path, payload).await?;
        state.index.insert(
            key.to_string(),
            IndexRecord {
                file_path,
                created_at: now,
                expires_at: ttl.expires_at(now, self.options.default_ttl),
                access_count: 0,
                last_access: now,
                size,
            },
        );
        self.save_index(&mut state).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut state = self.state.lock().await;
        let removed = self.remove_locked(&mut state, key).await?;
        if removed {
            self.save_index(&mut state).await?;
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        let records: Vec<IndexRecord> = state.index.drain().map(|(_, r)| r).collect();
        for record in records {
            Self::remove_blob(&record.file_path).await?;
        }
        self.save_index(&mut state).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(record) = state.index.get(key).cloned() else {
            return Ok(false);
        };
        if record.is_expired(now) {
            self.remove_locked(&mut state, key).await?;
            self.save_index(&mut state).await?;
            return Ok(false);
        }
        Ok(fs::try_exists(&record.file_path).await?)
    }

    async fn stats(&self) -> Result<TierStats, CacheError> {
        let now = Utc::now();
        let state = self.state.lock().await;
        Ok(TierStats {
            tier: self.name().to_string(),
            entry_count: state.index.len(),
            total_bytes: state.total_bytes(),
            expired_count: state.index.values().filter(|r| r.is_expired(now)).count(),
        })
    }

    async fn sweep_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .index
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove_locked(&mut state, key).await?;
        }
        if !expired.is_empty() || state.dirty {
            self.save_index(&mut state).await?;
        }
        Ok(expired.len())
    }
}
