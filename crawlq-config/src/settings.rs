//! Typed configuration sections. Every field has a default so an empty file
//! is a valid configuration.
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::config::ConfigError;
use crate::proxy::ProxySettings;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub queue: QueueSettings,
    pub redis: RedisSettings,
    pub proxy: ProxySettings,
    pub cache: CacheSettings,
    pub robots: RobotsSettings,
    pub worker: WorkerSettings,
    pub http: HttpSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(ok: bool, msg: &str) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid(msg.to_string()))
            }
        }

        check(!self.queue.name.is_empty(), "queue.name must not be empty")?;
        check(self.queue.lease_timeout_s > 0, "queue.lease_timeout_s must be > 0")?;
        check(
            self.queue.reaper_interval_s > 0,
            "queue.reaper_interval_s must be > 0",
        )?;
        check(self.queue.priority_decay >= 0, "queue.priority_decay must be >= 0")?;

        check(self.proxy.max_failures > 0, "proxy.max_failures must be > 0")?;
        check(
            (0.0..=1.0).contains(&self.proxy.min_success_rate),
            "proxy.min_success_rate must be within [0, 1]",
        )?;
        check(
            self.proxy.health_check_interval_s > 0,
            "proxy.health_check_interval_s must be > 0",
        )?;

        check(self.cache.default_ttl_s > 0, "cache.default_ttl_s must be > 0")?;
        check(self.cache.sweep_interval_s > 0, "cache.sweep_interval_s must be > 0")?;
        check(
            self.cache.memory.max_entries > 0,
            "cache.memory.max_entries must be > 0",
        )?;
        check(
            self.cache.memory.eviction_fraction > 0.0
                && self.cache.memory.eviction_fraction <= 1.0,
            "cache.memory.eviction_fraction must be within (0, 1]",
        )?;
        check(
            self.cache.disk.eviction_fraction > 0.0
                && self.cache.disk.eviction_fraction <= 1.0,
            "cache.disk.eviction_fraction must be within (0, 1]",
        )?;
        if self.cache.strategy.uses_disk() {
            check(
                !self.cache.disk.directory.as_os_str().is_empty(),
                "cache.disk.directory must be set for disk caching",
            )?;
            check(self.cache.disk.max_size_mb > 0, "cache.disk.max_size_mb must be > 0")?;
        }

        check(self.robots.cache_ttl_s > 0, "robots.cache_ttl_s must be > 0")?;
        check(self.worker.concurrency > 0, "worker.concurrency must be > 0")?;
        check(self.worker.fetch_timeout_s > 0, "worker.fetch_timeout_s must be > 0")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    pub max_retries: u32,
    pub lease_timeout_s: u64,
    /// Subtracted from a task's priority each time it is retried.
    pub priority_decay: i64,
    pub reaper_interval_s: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "crawlq".to_string(),
            max_retries: 3,
            lease_timeout_s: 300,
            priority_decay: 0,
            reaper_interval_s: 30,
        }
    }
}

impl QueueSettings {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_s)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// In-memory queue is used when no uri is configured.
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    Memory,
    Disk,
    #[default]
    Hybrid,
}

impl CacheStrategy {
    pub fn uses_memory(&self) -> bool {
        matches!(self, Self::Memory | Self::Hybrid)
    }

    pub fn uses_disk(&self) -> bool {
        matches!(self, Self::Disk | Self::Hybrid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub strategy: CacheStrategy,
    pub default_ttl_s: u64,
    pub sweep_interval_s: u64,
    pub memory: MemoryCacheSettings,
    pub disk: DiskCacheSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::default(),
            default_ttl_s: 3600,
            sweep_interval_s: 60,
            memory: MemoryCacheSettings::default(),
            disk: DiskCacheSettings::default(),
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_s)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheSettings {
    pub max_entries: usize,
    pub max_memory_mb: u64,
    pub eviction_fraction: f64,
}

impl Default for MemoryCacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_memory_mb: 100,
            eviction_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheSettings {
    pub directory: PathBuf,
    pub max_size_mb: u64,
    pub eviction_fraction: f64,
    /// Overrides `cache.default_ttl_s` for the disk tier.
    pub default_ttl_s: Option<u64>,
}

impl Default for DiskCacheSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("cache"),
            max_size_mb: 1000,
            eviction_fraction: 0.2,
            default_ttl_s: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotsSettings {
    pub enabled: bool,
    pub cache_ttl_s: u64,
    pub user_agent: String,
}

impl Default for RobotsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_s: 3600,
            user_agent: "crawlq".to_string(),
        }
    }
}

impl RobotsSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub fetch_timeout_s: u64,
    pub no_task_delay_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fetch_timeout_s: 30,
            no_task_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_s: u64,
    pub connect_timeout_s: u64,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_s: 30,
            connect_timeout_s: 10,
            user_agent: "crawlq/0.1".to_string(),
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}
