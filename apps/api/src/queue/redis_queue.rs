//! Redis-backed task queue.
//!
//! Layout under `queue:<name>:`
//! - `tasks`   HASH  task id -> envelope JSON
//! - `wait`    LIST  ids ready for delivery (LPUSH in, RPOP out)
//! - `active`  LIST  ids currently leased to a worker
//! - `leases`  ZSET  id scored by lease deadline (ms)
//! - `holders` HASH  task id -> lease id of the current reservation
//! - `delayed` ZSET  id scored by retry due time (ms)
//! - `failed`  ZSET  id scored by failure time (ms)
//!
//! Every transition touching more than one key runs as a Lua script.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};
use uuid::Uuid;

use super::{EvaluationTask, QueueCounts, QueueError, TaskEnvelope, TaskQueue};

/// Upper bound on ids moved by a single promote/requeue sweep.
const SWEEP_BATCH: usize = 500;

mod scripts {
    use redis::Script;

    /// KEYS: tasks, wait | ARGV: id, payload
    pub fn enqueue() -> Script {
        Script::new(
            r#"
            if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
                return 0
            end
            redis.call('LPUSH', KEYS[2], ARGV[1])
            return 1
            "#,
        )
    }

    /// KEYS: wait, active, leases, tasks, holders | ARGV: lease_deadline_ms, lease_id
    pub fn reserve() -> Script {
        Script::new(
            r#"
            while true do
                local id = redis.call('RPOP', KEYS[1])
                if not id then
                    return false
                end
                local payload = redis.call('HGET', KEYS[4], id)
                if payload then
                    redis.call('LPUSH', KEYS[2], id)
                    redis.call('ZADD', KEYS[3], ARGV[1], id)
                    redis.call('HSET', KEYS[5], id, ARGV[2])
                    return payload
                end
            end
            "#,
        )
    }

    /// KEYS: leases, holders | ARGV: id, lease_id, lease_deadline_ms
    pub fn renew() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
                return 0
            end
            redis.call('ZADD', KEYS[1], 'XX', ARGV[3], ARGV[1])
            return 1
            "#,
        )
    }

    /// KEYS: active, leases, tasks, holders | ARGV: id, lease_id
    pub fn complete() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[2] then
                return 0
            end
            redis.call('LREM', KEYS[1], 0, ARGV[1])
            redis.call('ZREM', KEYS[2], ARGV[1])
            redis.call('HDEL', KEYS[3], ARGV[1])
            redis.call('HDEL', KEYS[4], ARGV[1])
            return 1
            "#,
        )
    }

    /// Moves a held id into a scored set (delayed or failed).
    /// KEYS: active, leases, tasks, target, holders | ARGV: id, payload, score_ms, lease_id
    pub fn park() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[5], ARGV[1]) ~= ARGV[4] then
                return 0
            end
            redis.call('LREM', KEYS[1], 0, ARGV[1])
            redis.call('ZREM', KEYS[2], ARGV[1])
            redis.call('HDEL', KEYS[5], ARGV[1])
            redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
            redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
            return 1
            "#,
        )
    }

    /// KEYS: failed, tasks, wait | ARGV: id, payload
    pub fn requeue_failed() -> Script {
        Script::new(
            r#"
            if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
                return 0
            end
            redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
            redis.call('LPUSH', KEYS[3], ARGV[1])
            return 1
            "#,
        )
    }

    /// KEYS: delayed, wait | ARGV: now_ms, limit
    pub fn promote_due() -> Script {
        Script::new(
            r#"
            local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
            for _, id in ipairs(due) do
                redis.call('ZREM', KEYS[1], id)
                redis.call('LPUSH', KEYS[2], id)
            end
            return #due
            "#,
        )
    }

    /// KEYS: leases, active, wait, holders | ARGV: now_ms, limit
    pub fn requeue_stalled() -> Script {
        Script::new(
            r#"
            local stalled = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
            for _, id in ipairs(stalled) do
                redis.call('ZREM', KEYS[1], id)
                redis.call('LREM', KEYS[2], 0, id)
                redis.call('HDEL', KEYS[4], id)
                redis.call('LPUSH', KEYS[3], id)
            end
            return #stalled
            "#,
        )
    }

    /// KEYS: failed, tasks
    pub fn list_failed() -> Script {
        Script::new(
            r#"
            local ids = redis.call('ZRANGE', KEYS[1], 0, -1)
            local out = {}
            for _, id in ipairs(ids) do
                local payload = redis.call('HGET', KEYS[2], id)
                if payload then
                    table.insert(out, payload)
                end
            end
            return out
            "#,
        )
    }

    /// KEYS: failed, tasks | ARGV: cutoff_ms, limit
    pub fn prune_failed() -> Script {
        Script::new(
            r#"
            local old = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
            for _, id in ipairs(old) do
                redis.call('ZREM', KEYS[1], id)
                redis.call('HDEL', KEYS[2], id)
            end
            return #old
            "#,
        )
    }
}

struct Keys {
    tasks: String,
    wait: String,
    active: String,
    leases: String,
    holders: String,
    delayed: String,
    failed: String,
}

impl Keys {
    fn new(name: &str) -> Self {
        let key = |suffix: &str| format!("queue:{name}:{suffix}");
        Self {
            tasks: key("tasks"),
            wait: key("wait"),
            active: key("active"),
            leases: key("leases"),
            holders: key("holders"),
            delayed: key("delayed"),
            failed: key("failed"),
        }
    }
}

struct Scripts {
    enqueue: Script,
    reserve: Script,
    renew: Script,
    complete: Script,
    park: Script,
    requeue_failed: Script,
    promote_due: Script,
    requeue_stalled: Script,
    list_failed: Script,
    prune_failed: Script,
}

/// Durable queue shared by every API and worker process pointing at the same Redis.
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    keys: Arc<Keys>,
    scripts: Arc<Scripts>,
}

impl RedisTaskQueue {
    pub fn new(conn: ConnectionManager, name: &str) -> Self {
        info!("Redis task queue '{name}' ready");
        Self {
            conn,
            keys: Arc::new(Keys::new(name)),
            scripts: Arc::new(Scripts {
                enqueue: scripts::enqueue(),
                reserve: scripts::reserve(),
                renew: scripts::renew(),
                complete: scripts::complete(),
                park: scripts::park(),
                requeue_failed: scripts::requeue_failed(),
                promote_due: scripts::promote_due(),
                requeue_stalled: scripts::requeue_stalled(),
                list_failed: scripts::list_failed(),
                prune_failed: scripts::prune_failed(),
            }),
        }
    }

    async fn park(
        &self,
        envelope: &TaskEnvelope,
        target: &str,
        score_ms: i64,
    ) -> Result<bool, QueueError> {
        let Some(lease_id) = envelope.lease_id else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(envelope)?;
        let moved: i64 = self
            .scripts
            .park
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .key(&self.keys.tasks)
            .key(target)
            .key(&self.keys.holders)
            .arg(envelope.id().to_string())
            .arg(payload)
            .arg(score_ms)
            .arg(lease_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        if moved == 0 {
            debug!(job_id = %envelope.id(), "Task is held under another lease");
        }
        Ok(moved == 1)
    }
}

fn millis_from_now(delay: Duration) -> i64 {
    let delay = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_add(delay)
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: EvaluationTask) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let envelope = TaskEnvelope::new(task);
        let payload = serde_json::to_string(&envelope)?;
        let added: i64 = self
            .scripts
            .enqueue
            .key(&self.keys.tasks)
            .key(&self.keys.wait)
            .arg(envelope.id().to_string())
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn reserve(&self, lease: Duration) -> Result<Option<TaskEnvelope>, QueueError> {
        let mut conn = self.conn.clone();
        let lease_id = Uuid::new_v4();
        let payload: Option<String> = self
            .scripts
            .reserve
            .key(&self.keys.wait)
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .key(&self.keys.tasks)
            .key(&self.keys.holders)
            .arg(millis_from_now(lease))
            .arg(lease_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let mut envelope: TaskEnvelope = serde_json::from_str(&payload)?;
        envelope.lease_id = Some(lease_id);
        Ok(Some(envelope))
    }

    async fn renew_lease(
        &self,
        envelope: &TaskEnvelope,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let Some(lease_id) = envelope.lease_id else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .scripts
            .renew
            .key(&self.keys.leases)
            .key(&self.keys.holders)
            .arg(envelope.id().to_string())
            .arg(lease_id.to_string())
            .arg(millis_from_now(lease))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn complete(&self, envelope: &TaskEnvelope) -> Result<bool, QueueError> {
        let Some(lease_id) = envelope.lease_id else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .complete
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .key(&self.keys.tasks)
            .key(&self.keys.holders)
            .arg(envelope.id().to_string())
            .arg(lease_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn schedule_retry(
        &self,
        envelope: &TaskEnvelope,
        delay: Duration,
    ) -> Result<bool, QueueError> {
        self.park(envelope, &self.keys.delayed, millis_from_now(delay))
            .await
    }

    async fn move_to_failed(&self, envelope: &TaskEnvelope) -> Result<bool, QueueError> {
        let failed_at = envelope.failed_at.unwrap_or_else(Utc::now);
        self.park(envelope, &self.keys.failed, failed_at.timestamp_millis())
            .await
    }

    async fn list_failed(&self) -> Result<Vec<TaskEnvelope>, QueueError> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = self
            .scripts
            .list_failed
            .key(&self.keys.failed)
            .key(&self.keys.tasks)
            .invoke_async(&mut conn)
            .await?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(QueueError::from))
            .collect()
    }

    async fn requeue_failed(&self, envelope: &TaskEnvelope) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(envelope)?;
        let moved: i64 = self
            .scripts
            .requeue_failed
            .key(&self.keys.failed)
            .key(&self.keys.tasks)
            .key(&self.keys.wait)
            .arg(envelope.id().to_string())
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let promoted: usize = self
            .scripts
            .promote_due
            .key(&self.keys.delayed)
            .key(&self.keys.wait)
            .arg(now.timestamp_millis())
            .arg(SWEEP_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }

    async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let requeued: usize = self
            .scripts
            .requeue_stalled
            .key(&self.keys.leases)
            .key(&self.keys.active)
            .key(&self.keys.wait)
            .key(&self.keys.holders)
            .arg(now.timestamp_millis())
            .arg(SWEEP_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(requeued)
    }

    async fn prune_failed(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let pruned: usize = self
            .scripts
            .prune_failed
            .key(&self.keys.failed)
            .key(&self.keys.tasks)
            .arg(cutoff.timestamp_millis())
            .arg(SWEEP_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(pruned)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed, failed): (u64, u64, u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(&self.keys.wait)
            .cmd("LLEN")
            .arg(&self.keys.active)
            .cmd("ZCARD")
            .arg(&self.keys.delayed)
            .cmd("ZCARD")
            .arg(&self.keys.failed)
            .query_async(&mut conn)
            .await?;
        Ok(QueueCounts {
            waiting,
            active,
            delayed,
            failed,
        })
    }
}
