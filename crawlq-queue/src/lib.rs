//! Shared task queue: priority ordering, exclusive leases, bounded retries and
//! write-once terminal outcomes, with in-memory and Redis backends.
pub mod backend;
pub mod queue;
pub mod serializers;
pub mod task;

pub use crate::backend::InMemoryTaskQueue;
#[cfg(feature = "redis")]
pub use crate::backend::RedisTaskQueue;
pub use crate::queue::{AbstractTaskQueue, QueueOptions, TaskQueue};
pub use crate::serializers::{JsonSerializer, TaskSerializer};
pub use crate::task::{
    Lease, QueueStats, Task, TaskId, TaskOutcome, TaskStatus, Transition, WorkerId,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskQueueError {
    #[error("Queue error: {0}")]
    QueueError(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("Unexpected backend reply: {0}")]
    UnexpectedReply(String),
    #[cfg(feature = "redis")]
    #[error("Redis error")]
    RedisError(#[from] rustis::Error),
}

impl TaskQueueError {
    /// Errors meaning the store itself is unusable, as opposed to a problem
    /// with one task.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::QueueError(_) | Self::UnexpectedReply(_) => true,
            #[cfg(feature = "redis")]
            Self::RedisError(_) => true,
            _ => false,
        }
    }
}
