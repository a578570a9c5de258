use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use uuid::Uuid;

/// Namespace for ids derived from external keys.
const EXTERNAL_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6ba7b811_9dad_11d1_80b4_00c04fd430c8);

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Stable id for an external key; enqueueing the same key twice is a no-op.
    pub fn from_external_key(key: &str) -> Self {
        Self(Uuid::new_v5(&EXTERNAL_ID_NAMESPACE, key.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the process-local worker holding a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Leased,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Temporary exclusive ownership of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: WorkerId,
    pub started_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: WorkerId) -> Self {
        Self {
            owner,
            started_at: Utc::now(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.age(now) > timeout
    }

    pub fn is_held_by(&self, owner: &WorkerId) -> bool {
        self.owner == *owner
    }
}

/// Terminal record of a task. Written once, never replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub finished_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: TaskStatus::Completed,
            finished_at: Utc::now(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: &str) -> Self {
        Self {
            status: TaskStatus::Failed,
            finished_at: Utc::now(),
            result: None,
            error: Some(error.to_string()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: TaskStatus::Cancelled,
            finished_at: Utc::now(),
            result: None,
            error: None,
        }
    }
}

/// A `Task` is a single unit of work processed by a worker. The payload `D`
/// carries what to do; the remaining fields track priority, retries, the
/// current lease and the terminal outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task<D: Clone> {
    pub task_id: TaskId,
    pub payload: D,
    pub priority: i64,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub lease: Option<Lease>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_msg: Option<String>,
}

impl<D: Clone> Task<D> {
    pub fn new(payload: D) -> Self {
        Self::with_id(TaskId::new(), payload)
    }

    pub fn with_id(task_id: TaskId, payload: D) -> Self {
        Task {
            task_id,
            payload,
            priority: 0,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            lease: None,
            finished_at: None,
            result: None,
            error_msg: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn get_payload(&self) -> &D {
        &self.payload
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Copy a terminal outcome onto the task view.
    pub fn apply_outcome(&mut self, outcome: TaskOutcome) {
        self.status = outcome.status;
        self.finished_at = Some(outcome.finished_at);
        self.lease = None;
        self.result = outcome.result;
        if outcome.error.is_some() {
            self.error_msg = outcome.error;
        }
    }
}

/// What a state-changing queue call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Completed,
    Retrying { retries: u32 },
    Failed,
    Cancelled,
    /// The task was already terminal; nothing changed.
    AlreadyTerminal(TaskStatus),
    /// Another worker holds the lease now; nothing changed.
    LeaseLost,
}

impl Transition {
    pub fn changed(&self) -> bool {
        !matches!(self, Self::AlreadyTerminal(_) | Self::LeaseLost)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub fn terminal(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new(42u32).with_priority(5);
        assert_eq!(task.priority, 5);
        assert_eq!(task.retries, 0);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.can_retry());
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_external_ids_are_stable() {
        let a = TaskId::from_external_key("https://example.com/a");
        let b = TaskId::from_external_key("https://example.com/a");
        let c = TaskId::from_external_key("https://example.com/b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().parse::<TaskId>().unwrap(), a);
    }

    #[test]
    fn test_lease_expiry() {
        let lease = Lease::new(WorkerId::new("w-1"));
        let later = lease.started_at + chrono::Duration::seconds(10);
        assert!(lease.is_expired(later, Duration::from_secs(5)));
        assert!(!lease.is_expired(later, Duration::from_secs(30)));
    }

    #[test]
    fn test_apply_outcome() {
        let mut task = Task::new("payload".to_string());
        task.lease = Some(Lease::new(WorkerId::new("w-1")));
        task.apply_outcome(TaskOutcome::failed("boom"));
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.lease.is_none());
        assert_eq!(task.error_msg.as_deref(), Some("boom"));
        assert!(task.finished_at.is_some());
    }
}
