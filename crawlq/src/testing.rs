//! In-process doubles for the network collaborators.
#![allow(clippy::unwrap_used)]
use async_trait::async_trait;
use crawlq_cache::{CacheManager, CacheTier, MemoryTier, MemoryTierOptions};
use crawlq_config::{CacheStrategy, LoadedConfig, Settings};
use crawlq_proxy::{PoolOptions, ProxyEndpoint, ProxyPool};
use crawlq_queue::{
    AbstractTaskQueue, InMemoryTaskQueue, JsonSerializer, QueueStats, Task, TaskId, TaskQueue,
    TaskQueueError, Transition, WorkerId,
};
use crawlq_robots::{PolicyFetch, PolicySource, RobotsEngine, RobotsError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::context::CrawlContext;
use crate::fetch::{FetchError, FetchRequest, FetchResponse, Fetcher};

type Hook = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Status(u16),
    Transport,
    /// Never answers, for timeout paths.
    Hang,
}

#[derive(Default)]
struct MockState {
    routes: HashMap<String, Step>,
    fallback: Option<Step>,
    proxies_seen: Vec<Option<String>>,
    hook: Option<Arc<Hook>>,
}

/// Answers per url from a routing table and records what it was asked.
#[derive(Clone, Default)]
pub struct MockFetcher {
    state: Arc<Mutex<MockState>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, step: Step) -> Self {
        self.state.lock().unwrap().routes.insert(url.to_string(), step);
        self
    }

    pub fn fallback(self, step: Step) -> Self {
        self.state.lock().unwrap().fallback = Some(step);
        self
    }

    /// Runs before every answer.
    pub fn on_fetch<F>(&self, hook: F)
    where
        F: Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        self.state.lock().unwrap().hook = Some(Arc::new(Box::new(hook)));
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().proxies_seen.len()
    }

    pub fn proxies_seen(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().proxies_seen.clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchResponse, FetchError> {
        let (step, hook) = {
            let mut state = self.state.lock().unwrap();
            state.proxies_seen.push(proxy.map(|p| p.address.clone()));
            let step = state.routes.get(&request.url).copied().or(state.fallback);
            (step, state.hook.clone())
        };
        if let Some(hook) = hook {
            hook().await;
        }
        match step {
            Some(Step::Status(status)) => Ok(FetchResponse {
                status,
                body: format!("<html>{}</html>", request.url),
                headers: BTreeMap::from([("content-type".to_string(), "text/html".to_string())]),
                latency: Duration::from_millis(20),
            }),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(FetchError::Transport("hang".into()))
            }
            Some(Step::Transport) | None => {
                Err(FetchError::Transport("connection refused".into()))
            }
        }
    }
}

/// Serves robots.txt bodies from a map. Unknown hosts have no policy.
#[derive(Clone, Default)]
pub struct StaticPolicy {
    policies: HashMap<String, String>,
}

impl StaticPolicy {
    pub fn with(mut self, policy_url: &str, body: &str) -> Self {
        self.policies.insert(policy_url.to_string(), body.to_string());
        self
    }
}

#[async_trait]
impl PolicySource for StaticPolicy {
    async fn fetch(&self, policy_url: &str) -> Result<PolicyFetch, RobotsError> {
        Ok(match self.policies.get(policy_url) {
            Some(body) => PolicyFetch::Found(body.clone()),
            None => PolicyFetch::Missing(404),
        })
    }
}

/// In-memory queue that fails `lease_next` with scripted errors first.
pub struct ScriptedQueue {
    inner: InMemoryTaskQueue<FetchRequest, JsonSerializer>,
    lease_errors: Mutex<VecDeque<TaskQueueError>>,
}

impl ScriptedQueue {
    pub fn failing_leases(errors: Vec<TaskQueueError>) -> Self {
        Self {
            inner: InMemoryTaskQueue::new(),
            lease_errors: Mutex::new(errors.into()),
        }
    }
}

#[async_trait]
impl TaskQueue<FetchRequest> for ScriptedQueue {
    async fn enqueue(&self, task: &Task<FetchRequest>) -> Result<bool, TaskQueueError> {
        self.inner.enqueue(task).await
    }

    async fn lease_next(
        &self,
        owner: &WorkerId,
    ) -> Result<Option<Task<FetchRequest>>, TaskQueueError> {
        let scripted = self.lease_errors.lock().unwrap().pop_front();
        match scripted {
            Some(e) => Err(e),
            None => self.inner.lease_next(owner).await,
        }
    }

    async fn complete(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        result: serde_json::Value,
    ) -> Result<Transition, TaskQueueError> {
        self.inner.complete(task_id, owner, result).await
    }

    async fn fail(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        error: &str,
    ) -> Result<Transition, TaskQueueError> {
        self.inner.fail(task_id, owner, error).await
    }

    async fn fail_permanently(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        error: &str,
    ) -> Result<Transition, TaskQueueError> {
        self.inner.fail_permanently(task_id, owner, error).await
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<Transition, TaskQueueError> {
        self.inner.cancel(task_id).await
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task<FetchRequest>>, TaskQueueError> {
        self.inner.get(task_id).await
    }

    async fn stats(&self) -> Result<QueueStats, TaskQueueError> {
        self.inner.stats().await
    }

    async fn requeue_expired(
        &self,
        lease_timeout: Duration,
    ) -> Result<Vec<TaskId>, TaskQueueError> {
        self.inner.requeue_expired(lease_timeout).await
    }
}

pub async fn context(fetcher: MockFetcher, policy: StaticPolicy) -> Arc<CrawlContext> {
    context_with(Settings::default(), fetcher, policy, vec![]).await
}

/// In-memory queue, memory-only cache and the given proxies.
pub async fn context_with(
    settings: Settings,
    fetcher: MockFetcher,
    policy: StaticPolicy,
    proxies: Vec<ProxyEndpoint>,
) -> Arc<CrawlContext> {
    let queue = Arc::new(InMemoryTaskQueue::<FetchRequest, JsonSerializer>::new());
    context_with_queue(settings, queue, fetcher, policy, proxies).await
}

pub async fn context_with_queue(
    mut settings: Settings,
    queue: AbstractTaskQueue<FetchRequest>,
    fetcher: MockFetcher,
    policy: StaticPolicy,
    proxies: Vec<ProxyEndpoint>,
) -> Arc<CrawlContext> {
    settings.cache.strategy = CacheStrategy::Memory;
    let memory = MemoryTier::new(MemoryTierOptions::from_settings(&settings.cache));
    let cache = CacheManager::new(
        CacheStrategy::Memory,
        vec![Arc::new(memory) as Arc<dyn CacheTier>],
    );
    let config = LoadedConfig::from_settings(settings.clone());
    Arc::new(CrawlContext::new(
        config,
        queue,
        Arc::new(ProxyPool::new(proxies, PoolOptions::from(&settings.proxy))),
        Arc::new(cache),
        Arc::new(RobotsEngine::from_settings(Arc::new(policy), &settings.robots)),
        Arc::new(fetcher),
    ))
}
