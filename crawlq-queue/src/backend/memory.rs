//! In-memory implementation of the `TaskQueue` trait. Pending tasks live in a
//! B-tree keyed by `(priority, Reverse(seq))`, so the last entry is always the
//! highest priority and, among equals, the one enqueued first.
use crate::queue::QueueOptions;
use crate::task::{
    Lease, QueueStats, Task, TaskId, TaskOutcome, TaskStatus, Transition, WorkerId,
};
use crate::{TaskQueue, TaskQueueError, TaskSerializer};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

type PendingKey = (i64, Reverse<u64>);

struct TaskRecord {
    body: Vec<u8>,
    priority: i64,
    retries: u32,
    max_retries: u32,
    pending_key: Option<PendingKey>,
    lease: Option<Lease>,
    last_error: Option<String>,
    outcome: Option<TaskOutcome>,
}

#[derive(Default)]
struct QueueState {
    records: HashMap<TaskId, TaskRecord>,
    pending: BTreeMap<PendingKey, TaskId>,
    next_seq: u64,
}

impl QueueState {
    fn push_pending(&mut self, task_id: TaskId) {
        if let Some(record) = self.records.get_mut(&task_id) {
            self.next_seq += 1;
            let key = (record.priority, Reverse(self.next_seq));
            record.pending_key = Some(key);
            self.pending.insert(key, task_id);
        }
    }
}

pub struct InMemoryTaskQueue<D, S>
where
    S: TaskSerializer,
{
    state: Mutex<QueueState>,
    options: QueueOptions,
    _marker: PhantomData<(D, S)>,
}

impl<D, S> InMemoryTaskQueue<D, S>
where
    S: TaskSerializer,
{
    pub fn new() -> Self {
        Self::with_options(QueueOptions::default())
    }

    pub fn with_options(options: QueueOptions) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            options,
            _marker: PhantomData,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, TaskQueueError> {
        self.state
            .lock()
            .map_err(|e| TaskQueueError::QueueError(e.to_string()))
    }

    fn view<T>(record: &TaskRecord) -> Result<Task<T>, TaskQueueError>
    where
        T: Clone + Serialize + DeserializeOwned,
    {
        let mut task: Task<T> = S::deserialize_task(&record.body)?;
        task.priority = record.priority;
        task.retries = record.retries;
        task.max_retries = record.max_retries;
        task.lease = record.lease.clone();
        task.error_msg = record.last_error.clone();
        task.status = if record.lease.is_some() {
            TaskStatus::Leased
        } else {
            TaskStatus::Pending
        };
        if let Some(outcome) = &record.outcome {
            task.apply_outcome(outcome.clone());
        }
        Ok(task)
    }

    /// A report from `owner` is stale when someone else holds the lease.
    /// Reports without an owner, or on a task nobody holds, always apply.
    fn lease_lost(record: &TaskRecord, owner: Option<&WorkerId>) -> bool {
        match (owner, &record.lease) {
            (Some(owner), Some(lease)) => !lease.is_held_by(owner),
            _ => false,
        }
    }

    /// Write a terminal outcome unless one exists already.
    fn finish(
        &self,
        task_id: &TaskId,
        owner: Option<&WorkerId>,
        outcome: TaskOutcome,
        done: Transition,
    ) -> Result<Transition, TaskQueueError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let record = state
            .records
            .get_mut(task_id)
            .ok_or(TaskQueueError::TaskNotFound(*task_id))?;
        if let Some(existing) = &record.outcome {
            return Ok(Transition::AlreadyTerminal(existing.status));
        }
        if Self::lease_lost(record, owner) {
            tracing::debug!(%task_id, "Report from a worker without the lease ignored");
            return Ok(Transition::LeaseLost);
        }
        if let Some(key) = record.pending_key.take() {
            state.pending.remove(&key);
        }
        record.lease = None;
        record.outcome = Some(outcome);
        Ok(done)
    }

    fn fail_task(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        error: &str,
        permanent: bool,
    ) -> Result<Transition, TaskQueueError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let record = state
            .records
            .get_mut(task_id)
            .ok_or(TaskQueueError::TaskNotFound(*task_id))?;
        if let Some(existing) = &record.outcome {
            return Ok(Transition::AlreadyTerminal(existing.status));
        }
        if Self::lease_lost(record, Some(owner)) {
            tracing::debug!(%task_id, %owner, "Failure from a worker without the lease ignored");
            return Ok(Transition::LeaseLost);
        }

        record.last_error = Some(error.to_string());
        record.lease = None;
        if let Some(key) = record.pending_key.take() {
            state.pending.remove(&key);
        }

        if !permanent && record.retries < record.max_retries {
            record.retries += 1;
            record.priority -= self.options.priority_decay;
            let retries = record.retries;
            state.push_pending(*task_id);
            return Ok(Transition::Retrying { retries });
        }

        record.outcome = Some(TaskOutcome::failed(error));
        Ok(Transition::Failed)
    }
}

impl<D, S> Default for InMemoryTaskQueue<D, S>
where
    S: TaskSerializer,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D, S> TaskQueue<D> for InMemoryTaskQueue<D, S>
where
    D: std::fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    S: TaskSerializer + Send + Sync,
{
    async fn enqueue(&self, task: &Task<D>) -> Result<bool, TaskQueueError> {
        let task_bytes = S::serialize_task(task)?;
        let mut state = self.lock()?;
        if state.records.contains_key(&task.task_id) {
            tracing::debug!(task_id = %task.task_id, "Duplicate enqueue ignored");
            return Ok(false);
        }
        state.records.insert(
            task.task_id,
            TaskRecord {
                body: task_bytes,
                priority: task.priority,
                retries: task.retries,
                max_retries: task.max_retries,
                pending_key: None,
                lease: None,
                last_error: None,
                outcome: None,
            },
        );
        state.push_pending(task.task_id);
        Ok(true)
    }

    async fn lease_next(
        &self,
        owner: &WorkerId,
    ) -> Result<Option<Task<D>>, TaskQueueError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let Some((_, task_id)) = state.pending.pop_last() else {
            return Ok(None);
        };
        let record = state
            .records
            .get_mut(&task_id)
            .ok_or(TaskQueueError::TaskNotFound(task_id))?;
        record.pending_key = None;
        record.lease = Some(Lease::new(owner.clone()));
        match Self::view(record) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                // undecodable bodies end here, the error still goes to the caller
                tracing::warn!(%task_id, error = %e, "Undecodable task failed permanently");
                record.lease = None;
                record.last_error = Some(e.to_string());
                record.outcome = Some(TaskOutcome::failed(&e.to_string()));
                Err(e)
            }
        }
    }

    async fn complete(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        result: serde_json::Value,
    ) -> Result<Transition, TaskQueueError> {
        self.finish(
            task_id,
            Some(owner),
            TaskOutcome::completed(result),
            Transition::Completed,
        )
    }

    async fn fail(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        error: &str,
    ) -> Result<Transition, TaskQueueError> {
        self.fail_task(task_id, owner, error, false)
    }

    async fn fail_permanently(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        error: &str,
    ) -> Result<Transition, TaskQueueError> {
        self.fail_task(task_id, owner, error, true)
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<Transition, TaskQueueError> {
        self.finish(task_id, None, TaskOutcome::cancelled(), Transition::Cancelled)
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task<D>>, TaskQueueError> {
        let state = self.lock()?;
        state.records.get(task_id).map(Self::view::<D>).transpose()
    }

    async fn stats(&self) -> Result<QueueStats, TaskQueueError> {
        let state = self.lock()?;
        let mut stats = QueueStats {
            pending: state.pending.len() as u64,
            ..Default::default()
        };
        for record in state.records.values() {
            match record.outcome.as_ref().map(|o| o.status) {
                Some(TaskStatus::Completed) => stats.completed += 1,
                Some(TaskStatus::Failed) => stats.failed += 1,
                Some(TaskStatus::Cancelled) => stats.cancelled += 1,
                Some(_) => {}
                None if record.lease.is_some() => stats.leased += 1,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn requeue_expired(
        &self,
        lease_timeout: Duration,
    ) -> Result<Vec<TaskId>, TaskQueueError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let expired: Vec<TaskId> = state
            .records
            .iter()
            .filter(|(_, r)| r.outcome.is_none())
            .filter(|(_, r)| {
                r.lease
                    .as_ref()
                    .is_some_and(|lease| lease.is_expired(now, lease_timeout))
            })
            .map(|(id, _)| *id)
            .collect();

        for task_id in &expired {
            if let Some(record) = state.records.get_mut(task_id) {
                record.lease = None;
            }
            state.push_pending(*task_id);
            tracing::debug!(%task_id, "Lease expired, task requeued");
        }
        Ok(expired)
    }
}
