use crawlq_cache::CacheManager;
use crawlq_config::{Configurable, LoadedConfig, Settings};
use crawlq_proxy::{HealthProbe, ProxyPool};
use crawlq_queue::{AbstractTaskQueue, InMemoryTaskQueue, JsonSerializer, QueueOptions};
use crawlq_robots::{PolicySource, RobotsEngine};
use serde_yaml::Value;
use std::sync::Arc;

use crate::fetch::{FetchRequest, Fetcher};
use crate::throttle::HostThrottle;

/// Everything a worker needs, shared by every worker of the process.
pub struct CrawlContext {
    pub config: LoadedConfig,
    pub queue: AbstractTaskQueue<FetchRequest>,
    pub proxies: Arc<ProxyPool>,
    pub cache: Arc<CacheManager>,
    pub robots: Arc<RobotsEngine>,
    pub fetcher: Arc<dyn Fetcher>,
    pub throttle: HostThrottle,
}

impl std::fmt::Debug for CrawlContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlContext")
            .field("settings", &self.config.settings)
            .field("proxies", &self.proxies)
            .field("cache", &self.cache)
            .field("robots", &self.robots)
            .finish_non_exhaustive()
    }
}

impl Configurable for CrawlContext {
    fn config(&self) -> &Value {
        self.config.config()
    }
}

/// Queue described by the settings: Redis when `redis.uri` is set, in-memory
/// otherwise.
pub async fn build_queue(
    settings: &Settings,
) -> anyhow::Result<AbstractTaskQueue<FetchRequest>> {
    let options = QueueOptions {
        priority_decay: settings.queue.priority_decay,
    };
    match &settings.redis.uri {
        #[cfg(feature = "redis")]
        Some(uri) => {
            let client = rustis::client::Client::connect(uri.as_str()).await?;
            let queue = crawlq_queue::RedisTaskQueue::<FetchRequest, JsonSerializer>::with_options(
                client,
                &settings.queue.name,
                options,
            )
            .await?;
            tracing::info!(queue = %settings.queue.name, "Using redis task queue");
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("redis.uri is set but crawlq was built without the redis feature"),
        None => {
            tracing::info!(queue = %settings.queue.name, "Using in-memory task queue");
            Ok(Arc::new(
                InMemoryTaskQueue::<FetchRequest, JsonSerializer>::with_options(options),
            ))
        }
    }
}

impl CrawlContext {
    pub fn new(
        config: LoadedConfig,
        queue: AbstractTaskQueue<FetchRequest>,
        proxies: Arc<ProxyPool>,
        cache: Arc<CacheManager>,
        robots: Arc<RobotsEngine>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            queue,
            proxies,
            cache,
            robots,
            fetcher,
            throttle: HostThrottle::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    /// Wire every subsystem from configuration with the given collaborators.
    pub async fn with_collaborators(
        config: LoadedConfig,
        fetcher: Arc<dyn Fetcher>,
        policy_source: Arc<dyn PolicySource>,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> anyhow::Result<Self> {
        let settings = &config.settings;
        let queue = build_queue(settings).await?;

        let mut proxies = ProxyPool::from_settings(&settings.proxy);
        if let Some(probe) = probe {
            proxies = proxies.with_probe(probe);
        }
        let cache = CacheManager::from_settings(&settings.cache).await?;
        let robots = RobotsEngine::from_settings(policy_source, &settings.robots);

        Ok(Self::new(
            config,
            queue,
            Arc::new(proxies),
            Arc::new(cache),
            Arc::new(robots),
            fetcher,
        ))
    }

    /// Production wiring: reqwest fetcher, HTTP robots source and HTTP probes.
    #[cfg(feature = "http")]
    pub async fn from_config(config: LoadedConfig) -> anyhow::Result<Self> {
        let settings = &config.settings;
        let fetcher = Arc::new(crate::fetch::ReqwestFetcher::new(&settings.http));
        let policy_source = Arc::new(crawlq_robots::HttpPolicySource::new(&settings.http)?);
        let probe = Arc::new(crawlq_proxy::HttpProbe::new(
            settings.proxy.probe_url.clone(),
            &settings.http,
        ));
        Self::with_collaborators(config, fetcher, policy_source, Some(probe)).await
    }
}
