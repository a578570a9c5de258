#![deny(clippy::unwrap_used)]
use crate::context::CrawlContext;
use crate::fetch::{CrawlResult, FetchError, FetchRequest, FetchResponse};
use crate::manager::WorkerStats;
use crawlq_cache::CacheManager;
use crawlq_queue::{Task, TaskId, TaskQueueError, Transition, WorkerId};
use derive_builder::Builder;
use std::{sync::Arc, time::Duration};
use tokio::sync::{
    broadcast,
    mpsc::{self, error::TryRecvError},
};
use tracing::{debug, error, info, instrument, warn};

#[derive(Builder, Clone, Debug)]
#[builder(public, setter(into))]
pub struct WorkerOptions {
    #[builder(default = "None")]
    pub task_limit: Option<usize>,
    #[builder(default = "std::time::Duration::from_secs(1)")]
    pub no_task_found_delay: Duration,
    #[builder(default = "std::time::Duration::from_secs(30)")]
    pub fetch_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            task_limit: None,
            no_task_found_delay: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&crawlq_config::WorkerSettings> for WorkerOptions {
    fn from(settings: &crawlq_config::WorkerSettings) -> Self {
        Self {
            task_limit: None,
            no_task_found_delay: Duration::from_millis(settings.no_task_delay_ms),
            fetch_timeout: Duration::from_secs(settings.fetch_timeout_s),
        }
    }
}

pub enum WorkerCommand {
    Shutdown, // Gracefully shut down worker
}

/// How one task ended inside the pipeline, before it is written back.
#[derive(Debug)]
enum Outcome {
    Fetched(CrawlResult),
    Disallowed,
    /// Retryable: transport errors, timeouts, throttling, server errors.
    Transient(String),
    Permanent(String),
}

pub struct Worker {
    worker_id: WorkerId,
    ctx: Arc<CrawlContext>,
    pub stats: WorkerStats,
    pub options: WorkerOptions,
}

/// Leases one task at a time and drives it through cache, robots, crawl
/// delay, proxy and fetch before writing the outcome back to the queue.
impl Worker {
    pub fn new(worker_id: WorkerId, ctx: Arc<CrawlContext>, options: WorkerOptions) -> Self {
        Self {
            worker_id,
            ctx,
            options,
            stats: WorkerStats::new(),
        }
    }

    pub fn get_stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// One iteration. `Ok(false)` asks the caller to stop. Only errors that
    /// make the queue itself unusable are returned as `Err`; they must stop
    /// the worker.
    pub async fn run(&mut self) -> anyhow::Result<bool> {
        if let Some(limit) = self.options.task_limit {
            if self.stats.tasks_processed >= limit {
                warn!("task_limit reached: {}", limit);
                return Ok(false);
            }
        };

        let start_time = std::time::Instant::now();

        let task = match self.ctx.queue.lease_next(&self.worker_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("No tasks found, waiting...");
                tokio::time::sleep(self.options.no_task_found_delay).await;
                return Ok(true);
            }
            Err(e) if e.is_infrastructure() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Leased task is unusable, skipping");
                self.stats.record_failure();
                return Ok(true);
            }
        };

        let outcome = self.process(&task).await;
        self.settle(&task, outcome).await?;
        self.stats.record_execution_time(start_time.elapsed());
        Ok(true)
    }

    async fn process(&mut self, task: &Task<FetchRequest>) -> Outcome {
        let request = &task.payload;
        let settings = self.ctx.settings();
        let cache_key = CacheManager::generate_key(&request.url, request.params.as_ref());

        if let Some(response) = self.cached_response(&cache_key).await {
            self.stats.record_cache_hit();
            return Outcome::Fetched(CrawlResult {
                url: request.url.clone(),
                cache_key,
                from_cache: true,
                response,
            });
        }

        if settings.robots.enabled {
            let decision = self
                .ctx
                .robots
                .can_fetch(&request.effective_url(), &settings.robots.user_agent)
                .await;
            if !decision.allowed {
                return Outcome::Disallowed;
            }
            if let (Some(delay), Some(host)) = (decision.crawl_delay, host_of(&request.url)) {
                // the fetch must still fit inside the lease after the wait
                let max_wait = settings
                    .queue
                    .lease_timeout()
                    .saturating_sub(self.options.fetch_timeout);
                if !self.ctx.throttle.wait_turn(&host, delay, max_wait).await {
                    return Outcome::Transient("crawl delay backlog exceeds lease".to_string());
                }
            }
        }

        let proxy = if self.ctx.proxies.is_configured() {
            match self.ctx.proxies.get_endpoint() {
                Some(endpoint) => Some(endpoint),
                None => return Outcome::Transient("no active proxies".to_string()),
            }
        } else {
            None
        };

        let fetched = match tokio::time::timeout(
            self.options.fetch_timeout,
            self.ctx.fetcher.fetch(request, proxy.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(FetchError::Timeout(self.options.fetch_timeout)),
        };

        let response = match fetched {
            Ok(response) => response,
            Err(e) => {
                if let Some(endpoint) = &proxy {
                    self.report_proxy_failure(&endpoint.address, &e.to_string());
                }
                return Outcome::Transient(e.to_string());
            }
        };

        if let Some(endpoint) = &proxy {
            if response.status == 407 {
                self.report_proxy_failure(&endpoint.address, "proxy authentication required");
            } else if let Err(e) =
                self.ctx.proxies.report_success(&endpoint.address, response.latency)
            {
                warn!(proxy = %endpoint.address, error = %e, "Proxy report dropped");
            }
        }

        if response.is_success() {
            self.store_response(&cache_key, &response).await;
            Outcome::Fetched(CrawlResult {
                url: request.url.clone(),
                cache_key,
                from_cache: false,
                response,
            })
        } else if response.is_transient() {
            Outcome::Transient(format!("HTTP {}", response.status))
        } else {
            Outcome::Permanent(format!("HTTP {}", response.status))
        }
    }

    async fn cached_response(&self, key: &str) -> Option<FetchResponse> {
        let payload = self.ctx.cache.get(key).await?;
        match serde_json::from_slice(&payload) {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable cache entry");
                self.ctx.cache.delete(key).await;
                None
            }
        }
    }

    async fn store_response(&self, key: &str, response: &FetchResponse) {
        match serde_json::to_vec(response) {
            Ok(payload) => {
                if !self.ctx.cache.set(key, &payload, None).await {
                    debug!(key, "Response not cached by every tier");
                }
            }
            Err(e) => warn!(key, error = %e, "Response not cacheable"),
        }
    }

    fn report_proxy_failure(&self, address: &str, reason: &str) {
        if let Err(e) = self.ctx.proxies.report_failure(address, reason) {
            warn!(proxy = %address, error = %e, "Proxy report dropped");
        }
    }

    /// Write the outcome back. Only infrastructure errors escape.
    async fn settle(
        &mut self,
        task: &Task<FetchRequest>,
        outcome: Outcome,
    ) -> anyhow::Result<()> {
        let queue = &self.ctx.queue;
        let task_id = &task.task_id;
        let owner = &self.worker_id;
        let transition = match outcome {
            Outcome::Fetched(result) => match serde_json::to_value(&result) {
                Ok(value) => {
                    let status = result.response.status;
                    let from_cache = result.from_cache;
                    let transition = tolerate(task_id, queue.complete(task_id, owner, value).await)?;
                    if transition.is_some_and(|t| t.changed()) {
                        info!(%task_id, url = %task.payload.url, status, from_cache, "Task succeed");
                        self.stats.record_success();
                    }
                    transition
                }
                Err(e) => {
                    let reason = format!("result not serializable: {e}");
                    self.settle_permanent(task, &reason).await?
                }
            },
            Outcome::Disallowed => {
                self.stats.record_robots_skip();
                let transition = tolerate(
                    task_id,
                    queue.fail_permanently(task_id, owner, "disallowed by robots.txt").await,
                )?;
                if transition.is_some_and(|t| t.changed()) {
                    info!(%task_id, url = %task.payload.url, "Skipped, disallowed by robots.txt");
                    self.stats.record_failure();
                }
                transition
            }
            Outcome::Permanent(reason) => self.settle_permanent(task, &reason).await?,
            Outcome::Transient(reason) => {
                let transition = tolerate(task_id, queue.fail(task_id, owner, &reason).await)?;
                match transition {
                    Some(Transition::Retrying { retries }) => {
                        warn!(
                            %task_id,
                            url = %task.payload.url,
                            %reason,
                            "Task failed, retrying ({}/{})",
                            retries,
                            task.max_retries
                        );
                        self.stats.record_retry();
                    }
                    Some(Transition::Failed) => {
                        error!(
                            %task_id,
                            url = %task.payload.url,
                            %reason,
                            "Task failed, max retries ({}) exceeded",
                            task.max_retries
                        );
                        self.stats.record_failure();
                    }
                    _ => {}
                }
                transition
            }
        };

        match transition {
            Some(Transition::AlreadyTerminal(status)) => {
                info!(%task_id, %status, "Task already terminal, outcome discarded");
            }
            Some(Transition::LeaseLost) => {
                warn!(%task_id, "Lease taken over by another worker, outcome discarded");
            }
            _ => {}
        }
        Ok(())
    }

    async fn settle_permanent(
        &mut self,
        task: &Task<FetchRequest>,
        reason: &str,
    ) -> anyhow::Result<Option<Transition>> {
        let task_id = &task.task_id;
        let transition = tolerate(
            task_id,
            self.ctx
                .queue
                .fail_permanently(task_id, &self.worker_id, reason)
                .await,
        )?;
        if transition.is_some_and(|t| t.changed()) {
            warn!(%task_id, url = %task.payload.url, %reason, "Task failed permanently");
            self.stats.record_failure();
        }
        Ok(transition)
    }
}

/// Errors about a single task are logged and dropped. Errors that make the
/// queue unusable stop the worker.
fn tolerate(
    task_id: &TaskId,
    result: Result<Transition, TaskQueueError>,
) -> anyhow::Result<Option<Transition>> {
    match result {
        Ok(transition) => Ok(Some(transition)),
        Err(e) if e.is_infrastructure() => Err(e.into()),
        Err(e) => {
            error!(%task_id, error = %e, "Outcome not recorded");
            Ok(None)
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("options", &self.options)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Drives a worker until it is told to stop, runs out of work or loses the
/// queue. Returns the worker's counters.
#[instrument(fields(worker_id = %worker_id), skip(ctx, commands, terminate, worker_options))]
pub async fn worker_wrapper(
    worker_id: WorkerId,
    ctx: Arc<CrawlContext>,
    mut commands: mpsc::Receiver<WorkerCommand>,
    mut terminate: broadcast::Receiver<()>,
    worker_options: WorkerOptions,
) -> WorkerStats {
    let mut worker = Worker::new(worker_id.clone(), ctx, worker_options);
    let mut should_stop = false;

    'worker: loop {
        tokio::select! {
            _ = terminate.recv() => {
                info!("Terminating immediately");
                return worker.stats;
            },
            run_result = worker.run(), if !should_stop => {
                match commands.try_recv() {
                    Ok(WorkerCommand::Shutdown) => {
                        info!("[{}] Shutdown received", worker_id);
                        should_stop = true;
                    }
                    Err(TryRecvError::Disconnected) => break 'worker,
                    _ => {}
                }
                match run_result {
                    Ok(true) => {}
                    // i.e. task limit reached
                    Ok(false) => break 'worker,
                    Err(e) => {
                        error!(error = %e, "Queue unavailable, halting worker");
                        break 'worker;
                    }
                }
            }
        };

        // If a stop command was received, finish any ongoing work and then exit.
        if should_stop {
            info!("[{}] Completing current task before stopping.", worker_id);
            break;
        }
    }

    info!("completed");
    worker.stats
}
