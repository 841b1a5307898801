//! Sliding-window request counters.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

/// Records one hit against `key` if the window still has room.
#[async_trait]
pub trait WindowCounter: Send + Sync {
    async fn hit(&self, key: &str, limit: u32, window: Duration)
        -> Result<RateDecision, StoreError>;
}

/// Sliding window log: one sorted-set member per admitted request.
fn sliding_window_log() -> Script {
    Script::new(
        r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local limit = tonumber(ARGV[3])

        redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
        local current = redis.call('ZCARD', key)

        if current < limit then
            redis.call('ZADD', key, now, ARGV[4])
            redis.call('PEXPIRE', key, window)
            return {1, limit - current - 1}
        end

        local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
        local reset = window
        if oldest[2] then
            reset = tonumber(oldest[2]) + window - now
        end
        return {0, reset}
        "#,
    )
}

#[derive(Clone)]
pub struct RedisWindowCounter {
    conn: ConnectionManager,
    script: Script,
}

impl RedisWindowCounter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: sliding_window_log(),
        }
    }
}

#[async_trait]
impl WindowCounter for RedisWindowCounter {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, StoreError> {
        let mut conn = self.conn.clone();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_ms = window.as_millis().max(1) as i64;
        // Members must be unique or same-millisecond hits collapse into one.
        let member = format!("{now_ms}-{}", Uuid::new_v4());

        let reply: Vec<i64> = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(match reply.as_slice() {
            [1, remaining, ..] => RateDecision::Allowed {
                remaining: (*remaining).max(0) as u32,
            },
            [_, reset_ms, ..] => RateDecision::Limited {
                retry_after: Duration::from_millis((*reset_ms).max(0) as u64),
            },
            _ => RateDecision::Limited {
                retry_after: window,
            },
        })
    }
}
