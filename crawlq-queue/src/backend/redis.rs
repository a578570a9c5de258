//! Redis implementation of the `TaskQueue` trait. Every state transition runs
//! as a single Lua script, so leases, retries and terminal writes stay atomic
//! across processes sharing the same queue name.
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rustis::client::Client;
use rustis::commands::{CallBuilder, ScriptingCommands};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::time::Duration;

use crate::queue::QueueOptions;
use crate::task::{
    Lease, QueueStats, Task, TaskId, TaskOutcome, TaskStatus, Transition, WorkerId,
};
use crate::{TaskQueue, TaskQueueError, TaskSerializer};

/// Shared Lua prelude. KEYS order matches `RedisTaskQueue::keys`.
const PRELUDE: &str = r#"
local pending = KEYS[1]
local tasks = KEYS[2]
local priority = KEYS[3]
local retries = KEYS[4]
local limits = KEYS[5]
local members = KEYS[6]
local leases = KEYS[7]
local errors = KEYS[8]
local results = KEYS[9]
local counts = KEYS[10]
local seq = KEYS[11]

local function push_pending(id, prio)
  local n = redis.call('INCR', seq)
  local member = string.format('%015d', 999999999999999 - n) .. ':' .. id
  redis.call('ZADD', pending, prio, member)
  redis.call('HSET', members, id, member)
end

local function held_by_other(id, owner)
  if owner == '' then return false end
  local lease = redis.call('HGET', leases, id)
  if not lease then return false end
  return string.match(lease, '^(.*)|%d+$') ~= owner
end

local function drop_pending(id)
  local member = redis.call('HGET', members, id)
  if member then
    redis.call('ZREM', pending, member)
    redis.call('HDEL', members, id)
  end
end
"#;

const ENQUEUE: &str = r#"
local id = ARGV[1]
if redis.call('HEXISTS', tasks, id) == 1 then return 0 end
redis.call('HSET', tasks, id, ARGV[2])
redis.call('HSET', priority, id, ARGV[3])
redis.call('HSET', retries, id, ARGV[4])
redis.call('HSET', limits, id, ARGV[5])
push_pending(id, ARGV[3])
return 1
"#;

const LEASE_NEXT: &str = r#"
while true do
  local popped = redis.call('ZPOPMAX', pending, 1)
  if #popped == 0 then return {} end
  local id = string.sub(popped[1], 17)
  redis.call('HDEL', members, id)
  if redis.call('HEXISTS', results, id) == 0 and redis.call('HEXISTS', tasks, id) == 1 then
    local lease = ARGV[1] .. '|' .. ARGV[2]
    redis.call('HSET', leases, id, lease)
    return {
      id,
      redis.call('HGET', tasks, id),
      redis.call('HGET', priority, id) or '0',
      redis.call('HGET', retries, id) or '0',
      redis.call('HGET', limits, id) or '0',
      lease,
      redis.call('HGET', errors, id) or '',
      ''
    }
  end
end
"#;

const FINISH: &str = r#"
local id = ARGV[1]
if redis.call('HEXISTS', tasks, id) == 0 then return -1 end
if redis.call('HEXISTS', results, id) == 1 then return 0 end
if held_by_other(id, ARGV[4]) then return -3 end
redis.call('HSET', results, id, ARGV[2])
redis.call('HDEL', leases, id)
drop_pending(id)
redis.call('HINCRBY', counts, ARGV[3], 1)
return 1
"#;

const FAIL: &str = r#"
local id = ARGV[1]
if redis.call('HEXISTS', tasks, id) == 0 then return -1 end
if redis.call('HEXISTS', results, id) == 1 then return -2 end
if held_by_other(id, ARGV[6]) then return -3 end
redis.call('HSET', errors, id, ARGV[2])
redis.call('HDEL', leases, id)
drop_pending(id)
local r = tonumber(redis.call('HGET', retries, id) or '0')
local limit = tonumber(redis.call('HGET', limits, id) or '0')
if ARGV[5] == '0' and r < limit then
  r = r + 1
  redis.call('HSET', retries, id, r)
  local prio = tonumber(redis.call('HGET', priority, id) or '0') - tonumber(ARGV[4])
  redis.call('HSET', priority, id, prio)
  push_pending(id, prio)
  return r
end
redis.call('HSET', results, id, ARGV[3])
redis.call('HINCRBY', counts, 'failed', 1)
return 0
"#;

const GET: &str = r#"
local id = ARGV[1]
if redis.call('HEXISTS', tasks, id) == 0 then return {} end
return {
  id,
  redis.call('HGET', tasks, id),
  redis.call('HGET', priority, id) or '0',
  redis.call('HGET', retries, id) or '0',
  redis.call('HGET', limits, id) or '0',
  redis.call('HGET', leases, id) or '',
  redis.call('HGET', errors, id) or '',
  redis.call('HGET', results, id) or ''
}
"#;

const STATS: &str = r#"
return {
  redis.call('ZCARD', pending),
  redis.call('HLEN', leases),
  tonumber(redis.call('HGET', counts, 'completed') or '0'),
  tonumber(redis.call('HGET', counts, 'failed') or '0'),
  tonumber(redis.call('HGET', counts, 'cancelled') or '0')
}
"#;

const REQUEUE_EXPIRED: &str = r#"
local expired = {}
local all = redis.call('HGETALL', leases)
for i = 1, #all, 2 do
  local id = all[i]
  local started = tonumber(string.match(all[i + 1], '|(%d+)$'))
  if started and tonumber(ARGV[1]) - started > tonumber(ARGV[2]) then
    redis.call('HDEL', leases, id)
    if redis.call('HEXISTS', results, id) == 0 then
      push_pending(id, tonumber(redis.call('HGET', priority, id) or '0'))
      table.insert(expired, id)
    end
  end
end
return expired
"#;

const PURGE: &str = r#"
return redis.call('DEL', unpack(KEYS))
"#;

/// Raw task row as returned by the lease and get scripts.
struct TaskRow {
    id: TaskId,
    body: String,
    priority: i64,
    retries: u32,
    max_retries: u32,
    lease: Option<Lease>,
    error: Option<String>,
    outcome: Option<String>,
}

pub struct RedisTaskQueue<D, S>
where
    S: TaskSerializer,
{
    pub client: Client,
    pub name: String,
    options: QueueOptions,
    _marker: PhantomData<(D, S)>,
}

impl<D, S> std::fmt::Debug for RedisTaskQueue<D, S>
where
    S: TaskSerializer,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTaskQueue")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl<D, S> RedisTaskQueue<D, S>
where
    D: Send + Sync + 'static,
    S: TaskSerializer + Send + Sync,
{
    pub async fn new(client: Client, queue_name: &str) -> Result<Self, TaskQueueError> {
        Self::with_options(client, queue_name, QueueOptions::default()).await
    }

    pub async fn with_options(
        client: Client,
        queue_name: &str,
        options: QueueOptions,
    ) -> Result<Self, TaskQueueError> {
        Ok(Self {
            client,
            name: queue_name.to_string(),
            options,
            _marker: PhantomData,
        })
    }

    /// All keys used by this queue. The name is wrapped in a hash tag so a
    /// cluster keeps them in one slot.
    pub fn keys(&self) -> Vec<String> {
        [
            "pending", "tasks", "priority", "retries", "limits", "members",
            "leases", "errors", "results", "counts", "seq",
        ]
        .iter()
        .map(|suffix| format!("{{{}}}:{}", self.name, suffix))
        .collect()
    }

    /// Remove every key of this queue.
    pub async fn purge(&self) -> Result<(), TaskQueueError> {
        let _: i64 = self.client.eval(self.call(PURGE, vec![])).await?;
        Ok(())
    }

    fn call(&self, body: &str, args: Vec<String>) -> CallBuilder {
        CallBuilder::script(format!("{PRELUDE}{body}"))
            .keys(self.keys())
            .args(args)
    }

    fn parse_row(row: Vec<String>) -> Result<Option<TaskRow>, TaskQueueError> {
        if row.is_empty() {
            return Ok(None);
        }
        let [id, body, priority, retries, limit, lease, error, outcome]: [String; 8] = row
            .try_into()
            .map_err(|r: Vec<String>| {
                TaskQueueError::UnexpectedReply(format!("{} fields in task row", r.len()))
            })?;
        Ok(Some(TaskRow {
            id: id
                .parse()
                .map_err(|e: uuid::Error| TaskQueueError::UnexpectedReply(e.to_string()))?,
            body,
            priority: parse_number(&priority)?,
            retries: parse_number(&retries)?,
            max_retries: parse_number(&limit)?,
            lease: parse_lease(&lease)?,
            error: (!error.is_empty()).then_some(error),
            outcome: (!outcome.is_empty()).then_some(outcome),
        }))
    }

    fn view<T>(row: TaskRow) -> Result<Task<T>, TaskQueueError>
    where
        T: Clone + Serialize + DeserializeOwned,
    {
        let mut task: Task<T> = S::deserialize_task(row.body.as_bytes())?;
        task.priority = row.priority;
        task.retries = row.retries;
        task.max_retries = row.max_retries;
        task.error_msg = row.error;
        task.status = if row.lease.is_some() {
            TaskStatus::Leased
        } else {
            TaskStatus::Pending
        };
        task.lease = row.lease;
        if let Some(outcome) = row.outcome {
            task.apply_outcome(S::deserialize_value::<TaskOutcome>(&outcome)?);
        }
        Ok(task)
    }

    /// Status of a task already known to be terminal.
    async fn terminal_status(&self, task_id: &TaskId) -> Result<TaskStatus, TaskQueueError> {
        let row: Vec<String> = self
            .client
            .eval(self.call(GET, vec![task_id.to_string()]))
            .await?;
        let outcome = Self::parse_row(row)?
            .and_then(|row| row.outcome)
            .ok_or_else(|| {
                TaskQueueError::UnexpectedReply(format!("no outcome stored for {task_id}"))
            })?;
        Ok(S::deserialize_value::<TaskOutcome>(&outcome)?.status)
    }

    /// `owner` of `None` skips the lease check (cancellation).
    async fn finish(
        &self,
        task_id: &TaskId,
        owner: Option<&WorkerId>,
        outcome: TaskOutcome,
        transition: Transition,
    ) -> Result<Transition, TaskQueueError> {
        let counter = outcome.status.to_string();
        let owner = owner.map(WorkerId::to_string).unwrap_or_default();
        let code: i64 = self
            .client
            .eval(self.call(
                FINISH,
                vec![task_id.to_string(), S::serialize_value(&outcome)?, counter, owner],
            ))
            .await?;
        match code {
            1 => Ok(transition),
            0 => Ok(Transition::AlreadyTerminal(self.terminal_status(task_id).await?)),
            -1 => Err(TaskQueueError::TaskNotFound(*task_id)),
            -3 => Ok(Transition::LeaseLost),
            other => Err(TaskQueueError::UnexpectedReply(other.to_string())),
        }
    }

    async fn fail_task(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        error: &str,
        permanent: bool,
    ) -> Result<Transition, TaskQueueError> {
        let outcome = S::serialize_value(&TaskOutcome::failed(error))?;
        let code: i64 = self
            .client
            .eval(self.call(
                FAIL,
                vec![
                    task_id.to_string(),
                    error.to_string(),
                    outcome,
                    self.options.priority_decay.to_string(),
                    if permanent { "1" } else { "0" }.to_string(),
                    owner.to_string(),
                ],
            ))
            .await?;
        match code {
            0 => Ok(Transition::Failed),
            -1 => Err(TaskQueueError::TaskNotFound(*task_id)),
            -2 => Ok(Transition::AlreadyTerminal(self.terminal_status(task_id).await?)),
            -3 => Ok(Transition::LeaseLost),
            retries if retries > 0 => Ok(Transition::Retrying {
                retries: retries as u32,
            }),
            other => Err(TaskQueueError::UnexpectedReply(other.to_string())),
        }
    }
}

fn parse_number<N: std::str::FromStr>(raw: &str) -> Result<N, TaskQueueError> {
    raw.parse()
        .map_err(|_| TaskQueueError::UnexpectedReply(format!("not a number: {raw}")))
}

/// Leases are stored as `owner|started_ms`.
fn parse_lease(raw: &str) -> Result<Option<Lease>, TaskQueueError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let (owner, started) = raw
        .rsplit_once('|')
        .ok_or_else(|| TaskQueueError::UnexpectedReply(format!("bad lease: {raw}")))?;
    let started_ms: i64 = parse_number(started)?;
    let started_at: DateTime<Utc> = Utc
        .timestamp_millis_opt(started_ms)
        .single()
        .ok_or_else(|| TaskQueueError::UnexpectedReply(format!("bad lease time: {raw}")))?;
    Ok(Some(Lease {
        owner: WorkerId::new(owner),
        started_at,
    }))
}

#[async_trait]
impl<D, S> TaskQueue<D> for RedisTaskQueue<D, S>
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
        let task_str = String::from_utf8(task_bytes)
            .map_err(|e| TaskQueueError::Serialization(e.to_string()))?;
        let inserted: i64 = self
            .client
            .eval(self.call(
                ENQUEUE,
                vec![
                    task.task_id.to_string(),
                    task_str,
                    task.priority.to_string(),
                    task.retries.to_string(),
                    task.max_retries.to_string(),
                ],
            ))
            .await?;
        if inserted == 0 {
            tracing::debug!(task_id = %task.task_id, queue = %self.name, "Duplicate enqueue ignored");
        }
        Ok(inserted == 1)
    }

    async fn lease_next(
        &self,
        owner: &WorkerId,
    ) -> Result<Option<Task<D>>, TaskQueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let row: Vec<String> = self
            .client
            .eval(self.call(LEASE_NEXT, vec![owner.to_string(), now_ms.to_string()]))
            .await?;
        let Some(row) = Self::parse_row(row)? else {
            return Ok(None);
        };
        let task_id = row.id;
        match Self::view::<D>(row) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                // undecodable bodies end here, the error still goes to the caller
                tracing::warn!(%task_id, error = %e, "Undecodable task failed permanently");
                self.fail_task(&task_id, owner, &e.to_string(), true).await?;
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
        .await
    }

    async fn fail(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        error: &str,
    ) -> Result<Transition, TaskQueueError> {
        self.fail_task(task_id, owner, error, false).await
    }

    async fn fail_permanently(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        error: &str,
    ) -> Result<Transition, TaskQueueError> {
        self.fail_task(task_id, owner, error, true).await
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<Transition, TaskQueueError> {
        self.finish(task_id, None, TaskOutcome::cancelled(), Transition::Cancelled)
            .await
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task<D>>, TaskQueueError> {
        let row: Vec<String> = self
            .client
            .eval(self.call(GET, vec![task_id.to_string()]))
            .await?;
        Self::parse_row(row)?.map(Self::view::<D>).transpose()
    }

    async fn stats(&self) -> Result<QueueStats, TaskQueueError> {
        let counts: Vec<u64> = self.client.eval(self.call(STATS, vec![])).await?;
        match counts.as_slice() {
            [pending, leased, completed, failed, cancelled] => Ok(QueueStats {
                pending: *pending,
                leased: *leased,
                completed: *completed,
                failed: *failed,
                cancelled: *cancelled,
            }),
            other => Err(TaskQueueError::UnexpectedReply(format!(
                "{} fields in stats",
                other.len()
            ))),
        }
    }

    async fn requeue_expired(
        &self,
        lease_timeout: Duration,
    ) -> Result<Vec<TaskId>, TaskQueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let ids: Vec<String> = self
            .client
            .eval(self.call(
                REQUEUE_EXPIRED,
                vec![now_ms.to_string(), lease_timeout.as_millis().to_string()],
            ))
            .await?;
        ids.iter()
            .map(|id| {
                id.parse::<TaskId>()
                    .map_err(|e| TaskQueueError::UnexpectedReply(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lease() {
        let lease = parse_lease("host-1|worker|3|1700000000000").unwrap().unwrap();
        assert_eq!(lease.owner.as_str(), "host-1|worker|3");
        assert_eq!(lease.started_at.timestamp_millis(), 1_700_000_000_000);
        assert!(parse_lease("").unwrap().is_none());
        assert!(parse_lease("no-separator").is_err());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number::<i64>("-4").unwrap(), -4);
        assert!(parse_number::<u32>("x").is_err());
    }
}
