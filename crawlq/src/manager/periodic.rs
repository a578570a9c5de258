//! Background maintenance with an owned lifecycle: the lease reaper, proxy
//! health checks and the cache sweep. `stop` waits for the loops to exit.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::context::CrawlContext;

/// A job run every `interval` until stopped. The first run happens one
/// interval after start.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn start<F, Fut>(name: &'static str, interval: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => job().await,
                }
            }
            tracing::debug!(task = name, "Periodic task stopped");
        });
        tracing::debug!(task = name, ?interval, "Periodic task started");
        Self { name, stop, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the loop and wait for it. A job in progress finishes first.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            tracing::error!(task = self.name, error = %e, "Periodic task panicked");
        }
    }
}

/// The maintenance loops a process runs next to its workers.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: Vec<PeriodicTask>,
}

impl BackgroundTasks {
    pub fn start(ctx: Arc<CrawlContext>) -> Self {
        let settings = ctx.settings().clone();
        let mut tasks = Vec::new();

        let reaper_ctx = ctx.clone();
        let lease_timeout = settings.queue.lease_timeout();
        tasks.push(PeriodicTask::start(
            "lease_reaper",
            settings.queue.reaper_interval(),
            move || {
                let ctx = reaper_ctx.clone();
                async move {
                    match ctx.queue.requeue_expired(lease_timeout).await {
                        Ok(requeued) if !requeued.is_empty() => {
                            tracing::warn!(count = requeued.len(), "Requeued tasks with expired leases");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Lease reaper failed"),
                    }
                }
            },
        ));

        if ctx.proxies.is_configured() {
            let proxy_ctx = ctx.clone();
            tasks.push(PeriodicTask::start(
                "proxy_health_check",
                settings.proxy.health_check_interval(),
                move || {
                    let ctx = proxy_ctx.clone();
                    async move {
                        let report = ctx.proxies.health_check().await;
                        if report.checked > 0 {
                            tracing::info!(
                                checked = report.checked,
                                healthy = report.healthy,
                                "Proxy health check finished"
                            );
                        }
                    }
                },
            ));
        }

        let cache_ctx = ctx;
        tasks.push(PeriodicTask::start(
            "cache_sweep",
            settings.cache.sweep_interval(),
            move || {
                let ctx = cache_ctx.clone();
                async move {
                    ctx.cache.sweep_expired().await;
                }
            },
        ));

        Self { tasks }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(PeriodicTask::name).collect()
    }

    pub async fn stop(self) {
        for task in self.tasks {
            task.stop().await;
        }
    }
}
