//! Job Queue — durable, ordered, at-least-once delivery of evaluation tasks.
//!
//! A task moves between four sets:
//!
//! ```text
//! enqueue ──► wait ──reserve──► active ──complete──► (removed)
//!              ▲                  │
//!              │ promote_due      ├──schedule_retry──► delayed
//!              └──────────────────┤
//!              ▲ requeue_stalled  └──move_to_failed──► failed
//!              └──────────── requeue_failed ◄─────────────┘
//! ```
//!
//! A task id is its job id, so a job can sit in at most one set at a time.
//! Every reservation gets a fresh lease id; `complete`, `schedule_retry`,
//! `move_to_failed` and `renew_lease` only act for the current holder, so a
//! worker whose lease was reclaimed cannot touch the next holder's delivery.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::file::FileRecord;

pub mod redis_queue;

#[cfg(test)]
pub mod memory;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Corrupt task payload: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Self-contained work item: everything a worker needs without extra lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationTask {
    pub job_id: Uuid,
    pub job_title: String,
    pub cv: FileRecord,
    pub project_report: FileRecord,
}

/// A task plus its delivery bookkeeping, stored as one JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: EvaluationTask,
    /// Failed attempts against the current retry budget.
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    /// Set by `reserve`; never persisted.
    #[serde(skip)]
    pub lease_id: Option<Uuid>,
}

impl TaskEnvelope {
    pub fn new(task: EvaluationTask) -> Self {
        Self {
            task,
            attempts_made: 0,
            enqueued_at: Utc::now(),
            last_error: None,
            failed_at: None,
            lease_id: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.task.job_id
    }

    /// Fresh budget for a task leaving the failed set.
    pub fn reset_for_retry(&mut self) {
        self.attempts_made = 0;
        self.failed_at = None;
        self.enqueued_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Appends a task. Returns `false` if a task with the same id already exists.
    async fn enqueue(&self, task: EvaluationTask) -> Result<bool, QueueError>;

    /// Takes the oldest waiting task and leases it to the caller under a new
    /// lease id.
    async fn reserve(&self, lease: Duration) -> Result<Option<TaskEnvelope>, QueueError>;

    /// Pushes the lease deadline to `lease` from now. Returns `false` if the
    /// caller no longer holds the task.
    async fn renew_lease(&self, envelope: &TaskEnvelope, lease: Duration)
        -> Result<bool, QueueError>;

    /// Acknowledges a finished task and drops it. Returns `false` if the
    /// caller no longer holds the task.
    async fn complete(&self, envelope: &TaskEnvelope) -> Result<bool, QueueError>;

    /// Parks a held task until `delay` has elapsed. Returns `false` if the
    /// caller no longer holds the task.
    async fn schedule_retry(&self, envelope: &TaskEnvelope, delay: Duration)
        -> Result<bool, QueueError>;

    /// Moves a held task to the failed set. Returns `false` if the caller no
    /// longer holds the task.
    async fn move_to_failed(&self, envelope: &TaskEnvelope) -> Result<bool, QueueError>;

    /// Failed tasks, oldest failure first.
    async fn list_failed(&self) -> Result<Vec<TaskEnvelope>, QueueError>;

    /// Moves one task from the failed set back to the live queue, storing
    /// `envelope` as its new state. Returns `false` if it was not in the failed set.
    async fn requeue_failed(&self, envelope: &TaskEnvelope) -> Result<bool, QueueError>;

    /// Moves delayed tasks whose backoff has elapsed back to the live queue.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Returns active tasks whose lease expired to the live queue.
    async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Drops failed tasks that failed before `cutoff`.
    async fn prune_failed(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}

/// Bounded attempts with exponential backoff between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
    /// The lease was reclaimed before the failure could be recorded; the
    /// current holder owns the task.
    LeaseLost,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Applies the retry policy to a failed attempt: either parks the task in the
/// delayed set or moves it to the failed set once the budget is spent.
pub async fn settle_failure(
    queue: &dyn TaskQueue,
    policy: &RetryPolicy,
    mut envelope: TaskEnvelope,
    cause: &str,
) -> Result<FailureOutcome, QueueError> {
    envelope.attempts_made = envelope.attempts_made.saturating_add(1);
    envelope.last_error = Some(cause.to_string());
    let attempt = envelope.attempts_made;

    if attempt < policy.max_attempts {
        let delay = policy.delay_after(attempt);
        if !queue.schedule_retry(&envelope, delay).await? {
            return Ok(lease_lost(&envelope));
        }
        info!(
            job_id = %envelope.id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Task scheduled for retry"
        );
        Ok(FailureOutcome::Retrying { attempt, delay })
    } else {
        envelope.failed_at = Some(Utc::now());
        if !queue.move_to_failed(&envelope).await? {
            return Ok(lease_lost(&envelope));
        }
        warn!(
            job_id = %envelope.id(),
            attempts = attempt,
            "Task exhausted its retry budget, moved to failed set"
        );
        Ok(FailureOutcome::Exhausted { attempts: attempt })
    }
}

fn lease_lost(envelope: &TaskEnvelope) -> FailureOutcome {
    warn!(
        job_id = %envelope.id(),
        "Lease was reclaimed before the failure was recorded; leaving the task to its current holder"
    );
    FailureOutcome::LeaseLost
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use uuid::Uuid;

    use super::EvaluationTask;
    use crate::models::file::FileRecord;

    pub fn file(name: &str) -> FileRecord {
        let id = Uuid::new_v4();
        FileRecord {
            id,
            filename: name.to_string(),
            storage_ref: format!("uploads/{id}.pdf"),
            content_type: "application/pdf".to_string(),
            size_bytes: 128,
            uploaded_at: Utc::now(),
        }
    }

    pub fn task() -> EvaluationTask {
        EvaluationTask {
            job_id: Uuid::new_v4(),
            job_title: "Backend Engineer".to_string(),
            cv: file("cv.pdf"),
            project_report: file("project.pdf"),
        }
    }
}
