//! Trait for the shared, priority-ordered task store. Backends hand out
//! exclusive leases, record write-once terminal outcomes and requeue tasks
//! whose lease expired.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, sync::Arc, time::Duration};

use super::TaskQueueError;
use crate::task::{QueueStats, Task, TaskId, Transition, WorkerId};

#[async_trait]
pub trait TaskQueue<Data>: Send + Sync
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Insert a pending task. Returns `false` if the id is already known.
    async fn enqueue(&self, task: &Task<Data>) -> Result<bool, TaskQueueError>;

    /// Atomically take the highest priority pending task and lease it.
    async fn lease_next(
        &self,
        owner: &WorkerId,
    ) -> Result<Option<Task<Data>>, TaskQueueError>;

    /// Record a successful result. `owner` is the worker reporting it: while
    /// another worker holds the lease the call returns `LeaseLost` and changes
    /// nothing. The same rule applies to `fail` and `fail_permanently`.
    async fn complete(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        result: serde_json::Value,
    ) -> Result<Transition, TaskQueueError>;

    /// Requeue with one more retry, or record a terminal failure once retries
    /// are exhausted.
    async fn fail(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        error: &str,
    ) -> Result<Transition, TaskQueueError>;

    /// Terminal failure without retry.
    async fn fail_permanently(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        error: &str,
    ) -> Result<Transition, TaskQueueError>;

    async fn cancel(&self, task_id: &TaskId) -> Result<Transition, TaskQueueError>;

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task<Data>>, TaskQueueError>;

    async fn stats(&self) -> Result<QueueStats, TaskQueueError>;

    /// Drop leases older than `lease_timeout` and put their tasks back.
    async fn requeue_expired(
        &self,
        lease_timeout: Duration,
    ) -> Result<Vec<TaskId>, TaskQueueError>;
}

pub type AbstractTaskQueue<D> = Arc<dyn TaskQueue<D> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Subtracted from the priority each time a task is retried.
    pub priority_decay: i64,
}
