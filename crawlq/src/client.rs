//! Producer side: enqueue fetches and follow them to a terminal state.
use crawlq_queue::{
    AbstractTaskQueue, QueueStats, Task, TaskId, TaskQueueError, TaskStatus, Transition,
};
use std::time::Duration;
use thiserror::Error;

use crate::fetch::FetchRequest;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Queue(#[from] TaskQueueError),
    #[error("Task not found: {0}")]
    NotFound(TaskId),
    #[error("Task {task_id} still {status} after {waited:?}")]
    Timeout {
        task_id: TaskId,
        status: TaskStatus,
        waited: Duration,
    },
}

#[derive(Clone)]
pub struct CrawlClient {
    queue: AbstractTaskQueue<FetchRequest>,
    max_retries: u32,
    poll_interval: Duration,
}

impl std::fmt::Debug for CrawlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlClient")
            .field("max_retries", &self.max_retries)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl CrawlClient {
    pub fn new(queue: AbstractTaskQueue<FetchRequest>, max_retries: u32) -> Self {
        Self {
            queue,
            max_retries,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn from_context(ctx: &crate::CrawlContext) -> Self {
        Self::new(ctx.queue.clone(), ctx.settings().queue.max_retries)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn task(&self, task_id: TaskId, request: FetchRequest, priority: i64) -> Task<FetchRequest> {
        Task::with_id(task_id, request)
            .with_priority(priority)
            .with_max_retries(self.max_retries)
    }

    /// Always creates a new task.
    pub async fn enqueue(
        &self,
        request: FetchRequest,
        priority: i64,
    ) -> Result<TaskId, ClientError> {
        let task = self.task(TaskId::new(), request, priority);
        self.queue.enqueue(&task).await?;
        tracing::debug!(task_id = %task.task_id, url = %task.payload.url, priority, "Enqueued");
        Ok(task.task_id)
    }

    /// Idempotent enqueue: the id is derived from `key`, so enqueueing the
    /// same key twice yields one task.
    pub async fn enqueue_with_key(
        &self,
        key: &str,
        request: FetchRequest,
        priority: i64,
    ) -> Result<TaskId, ClientError> {
        let task = self.task(TaskId::from_external_key(key), request, priority);
        if !self.queue.enqueue(&task).await? {
            tracing::debug!(task_id = %task.task_id, key, "Task already known");
        }
        Ok(task.task_id)
    }

    pub async fn enqueue_batch(
        &self,
        requests: impl IntoIterator<Item = (FetchRequest, i64)>,
    ) -> Result<Vec<TaskId>, ClientError> {
        let mut ids = Vec::new();
        for (request, priority) in requests {
            ids.push(self.enqueue(request, priority).await?);
        }
        Ok(ids)
    }

    pub async fn cancel(&self, task_id: &TaskId) -> Result<Transition, ClientError> {
        Ok(self.queue.cancel(task_id).await?)
    }

    pub async fn status(&self, task_id: &TaskId) -> Result<Option<Task<FetchRequest>>, ClientError> {
        Ok(self.queue.get(task_id).await?)
    }

    /// Poll until the task is terminal or `timeout` passes.
    pub async fn wait_for_task(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<Task<FetchRequest>, ClientError> {
        let started = tokio::time::Instant::now();
        loop {
            let task = self
                .queue
                .get(task_id)
                .await?
                .ok_or(ClientError::NotFound(*task_id))?;
            if task.is_terminal() {
                return Ok(task);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(ClientError::Timeout {
                    task_id: *task_id,
                    status: task.status,
                    waited,
                });
            }
            tokio::time::sleep(self.poll_interval.min(timeout - waited)).await;
        }
    }

    pub async fn stats(&self) -> Result<QueueStats, ClientError> {
        Ok(self.queue.stats().await?)
    }
}
