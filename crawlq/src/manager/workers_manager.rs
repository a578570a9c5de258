use crate::context::CrawlContext;
use crate::manager::{
    worker_wrapper, BackgroundTasks, WorkerCommand, WorkerOptions, WorkerStats,
};
use crawlq_queue::WorkerId;
use derive_builder::Builder;
use std::future::Future;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::{
    signal,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::Instrument;

type WorkerCommandSenders = Arc<Vec<mpsc::Sender<WorkerCommand>>>;

#[derive(Builder, Default, Clone, Debug)]
#[builder(public, setter(into))]
pub struct WorkersManagerOptions {
    #[builder(default)]
    pub worker_options: WorkerOptions,
    #[builder(default = "4")]
    pub concurrency_limit: usize,
    /// Prefix of worker ids, unique per process when several share a queue.
    #[builder(default = "String::from(\"worker\")")]
    pub worker_prefix: String,
}

impl WorkersManagerOptions {
    pub fn from_settings(settings: &crawlq_config::Settings) -> Self {
        Self {
            worker_options: WorkerOptions::from(&settings.worker),
            concurrency_limit: settings.worker.concurrency,
            worker_prefix: format!("{}-{}", settings.queue.name, std::process::id()),
        }
    }
}

pub struct WorkersManager {
    pub ctx: Arc<CrawlContext>,
    pub options: WorkersManagerOptions,
}

impl WorkersManager {
    pub fn new(ctx: Arc<CrawlContext>, options: WorkersManagerOptions) -> Self {
        Self { ctx, options }
    }

    /// Run until Ctrl+C. Once stops gracefully, twice terminates.
    pub async fn run_workers(&mut self) -> Vec<WorkerStats> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until `shutdown` resolves (or Ctrl+C), then stop workers
    /// gracefully and join the background tasks.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Vec<WorkerStats>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let background = BackgroundTasks::start(self.ctx.clone());
        let mut worker_handlers = Vec::new();
        let mut senders = Vec::new();
        let (terminate_sender, _) = broadcast::channel::<()>(10);

        for i in 1..=self.options.concurrency_limit {
            let worker_id = WorkerId::new(format!("{}-{}", self.options.worker_prefix, i));
            let (command_sender, command_receiver) = mpsc::channel::<WorkerCommand>(100);
            senders.push(command_sender);
            let terminate_receiver = terminate_sender.subscribe();

            let worker_span = tracing::info_span!("worker", worker_id = %worker_id);
            let worker = tokio::spawn(
                worker_wrapper(
                    worker_id,
                    Arc::clone(&self.ctx),
                    command_receiver,
                    terminate_receiver,
                    self.options.worker_options.clone(),
                )
                .instrument(worker_span),
            );
            worker_handlers.push(worker);
        }
        let command_senders: WorkerCommandSenders = Arc::new(senders);

        // Single Ctrl+C sends Shutdown to all workers, the next one
        // terminates them immediately.
        let ctrl_c = Self::ctrl_c_handler(command_senders.clone(), terminate_sender);
        let external = {
            let command_senders = command_senders.clone();
            tokio::spawn(async move {
                shutdown.await;
                tracing::info!("Shutdown requested, stopping workers...");
                Self::broadcast_shutdown(&command_senders).await;
            })
        };

        let mut stats = Vec::with_capacity(worker_handlers.len());
        for (worker_id, handler) in worker_handlers.into_iter().enumerate() {
            let worker_id = worker_id + 1;
            match handler.await {
                Ok(worker_stats) => {
                    tracing::info!("[{}] Worker stopped: {:?}", worker_id, worker_stats);
                    stats.push(worker_stats);
                }
                Err(err) => {
                    tracing::error!("[{}] Fatal error in one of the workers: {:?}", worker_id, err);
                }
            }
        }

        external.abort();
        ctrl_c.abort();
        background.stop().await;
        tracing::info!("All workers stopped");
        stats
    }

    async fn broadcast_shutdown(command_senders: &[mpsc::Sender<WorkerCommand>]) {
        for sender in command_senders {
            let _ = sender.send(WorkerCommand::Shutdown).await;
        }
    }

    fn ctrl_c_handler(
        command_senders: WorkerCommandSenders,
        terminate_sender: broadcast::Sender<()>,
    ) -> JoinHandle<()> {
        let ctrl_c_counter = AtomicUsize::new(0);

        tokio::spawn(async move {
            loop {
                if let Err(e) = signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for ctrl+c event");
                    break;
                }
                match ctrl_c_counter.fetch_add(1, Ordering::SeqCst) {
                    0 => {
                        tracing::warn!("Ctrl+C received, sending stop command to all workers...");
                        Self::broadcast_shutdown(&command_senders).await;
                    }
                    _ => {
                        tracing::warn!("Ctrl+C received again, terminating all workers...");
                        let _ = terminate_sender.send(());
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fetch::FetchRequest;
    use crate::manager::WorkerOptionsBuilder;
    use crate::testing::{context, MockFetcher, StaticPolicy, Step};
    use crawlq_queue::{Task, TaskStatus};
    use std::time::Duration;

    #[test]
    fn excutor_options_builder() {
        let options = WorkersManagerOptionsBuilder::default().build().unwrap();
        assert_eq!(options.concurrency_limit, 4);
        assert_eq!(options.worker_prefix, "worker");

        let settings = crawlq_config::Settings::default();
        let options = WorkersManagerOptions::from_settings(&settings);
        assert_eq!(options.concurrency_limit, settings.worker.concurrency);
        assert!(options.worker_prefix.starts_with("crawlq-"));
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let fetcher = MockFetcher::new()
            .fallback(Step::Status(200))
            .route("https://example.com/p5", Step::Status(503));
        let ctx = context(fetcher.clone(), StaticPolicy::default()).await;
        let mut ids = Vec::new();
        for priority in [1, 5, 3] {
            let task = Task::new(FetchRequest::new(format!("https://example.com/p{priority}")))
                .with_priority(priority);
            ctx.queue.enqueue(&task).await.unwrap();
            ids.push(task.task_id);
        }

        let options = WorkersManagerOptionsBuilder::default()
            .concurrency_limit(2usize)
            .worker_options(
                WorkerOptionsBuilder::default()
                    .no_task_found_delay(Duration::from_millis(10))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let mut manager = WorkersManager::new(ctx.clone(), options);

        let queue = ctx.queue.clone();
        let stats = manager
            .run_until(async move {
                while queue.stats().await.unwrap().terminal() < 3 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;

        assert_eq!(stats.len(), 2);
        let total = WorkerStats::merge(&stats);
        assert_eq!(total.tasks_succeeded, 2);
        assert_eq!(total.tasks_failed, 1);
        assert_eq!(total.tasks_retried, 3);

        let statuses: Vec<TaskStatus> = statuses_of(&ctx, &ids).await;
        assert_eq!(
            statuses,
            vec![TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Completed]
        );
    }

    async fn statuses_of(
        ctx: &CrawlContext,
        ids: &[crawlq_queue::TaskId],
    ) -> Vec<TaskStatus> {
        let mut statuses = Vec::new();
        for id in ids {
            statuses.push(ctx.queue.get(id).await.unwrap().unwrap().status);
        }
        statuses
    }
}
