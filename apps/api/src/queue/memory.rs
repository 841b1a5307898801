use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{EvaluationTask, QueueCounts, QueueError, TaskEnvelope, TaskQueue};

struct Lease {
    id: Uuid,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, TaskEnvelope>,
    wait: VecDeque<Uuid>,
    active: HashMap<Uuid, Lease>,
    delayed: Vec<(DateTime<Utc>, Uuid)>,
    failed: Vec<(DateTime<Utc>, Uuid)>,
    retry_delays: Vec<(Uuid, Duration)>,
    requeued_from_failed: Vec<Uuid>,
    renewals: Vec<Uuid>,
}

impl Inner {
    /// Drops the caller's lease. `false` if the caller is not the current holder.
    fn release(&mut self, envelope: &TaskEnvelope) -> bool {
        let id = envelope.id();
        let held = matches!(
            (self.active.get(&id), envelope.lease_id),
            (Some(lease), Some(lease_id)) if lease.id == lease_id
        );
        if held {
            self.active.remove(&id);
        }
        held
    }
}

/// Single-process queue with the same set semantics as the Redis backend.
#[derive(Default)]
pub struct MemoryTaskQueue {
    inner: Mutex<Inner>,
}

impl MemoryTaskQueue {
    pub fn retry_delays(&self, id: Uuid) -> Vec<Duration> {
        self.inner
            .lock()
            .unwrap()
            .retry_delays
            .iter()
            .filter(|(task, _)| *task == id)
            .map(|(_, delay)| *delay)
            .collect()
    }

    pub fn requeued_from_failed(&self) -> Vec<Uuid> {
        self.inner.lock().unwrap().requeued_from_failed.clone()
    }

    pub fn waiting_ids(&self) -> Vec<Uuid> {
        self.inner.lock().unwrap().wait.iter().copied().collect()
    }

    pub fn stored(&self, id: Uuid) -> Option<TaskEnvelope> {
        self.inner.lock().unwrap().tasks.get(&id).cloned()
    }

    /// Successful lease renewals for `id`.
    pub fn renewals(&self, id: Uuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .renewals
            .iter()
            .filter(|renewed| **renewed == id)
            .count()
    }

    fn to_millis(delay: Duration) -> chrono::Duration {
        chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: EvaluationTask) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let id = task.job_id;
        if inner.tasks.contains_key(&id) {
            return Ok(false);
        }
        inner.tasks.insert(id, TaskEnvelope::new(task));
        inner.wait.push_back(id);
        Ok(true)
    }

    async fn reserve(&self, lease: Duration) -> Result<Option<TaskEnvelope>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        while let Some(id) = inner.wait.pop_front() {
            if let Some(mut envelope) = inner.tasks.get(&id).cloned() {
                let lease_id = Uuid::new_v4();
                inner.active.insert(
                    id,
                    Lease {
                        id: lease_id,
                        deadline: Utc::now() + Self::to_millis(lease),
                    },
                );
                envelope.lease_id = Some(lease_id);
                return Ok(Some(envelope));
            }
        }
        Ok(None)
    }

    async fn renew_lease(
        &self,
        envelope: &TaskEnvelope,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let id = envelope.id();
        let renewed = match (inner.active.get_mut(&id), envelope.lease_id) {
            (Some(held), Some(lease_id)) if held.id == lease_id => {
                held.deadline = Utc::now() + Self::to_millis(lease);
                true
            }
            _ => false,
        };
        if renewed {
            inner.renewals.push(id);
        }
        Ok(renewed)
    }

    async fn complete(&self, envelope: &TaskEnvelope) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.release(envelope) {
            return Ok(false);
        }
        inner.tasks.remove(&envelope.id());
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        envelope: &TaskEnvelope,
        delay: Duration,
    ) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.release(envelope) {
            return Ok(false);
        }
        let id = envelope.id();
        inner.tasks.insert(id, envelope.clone());
        inner.delayed.push((Utc::now() + Self::to_millis(delay), id));
        inner.retry_delays.push((id, delay));
        Ok(true)
    }

    async fn move_to_failed(&self, envelope: &TaskEnvelope) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.release(envelope) {
            return Ok(false);
        }
        let id = envelope.id();
        inner.tasks.insert(id, envelope.clone());
        inner
            .failed
            .push((envelope.failed_at.unwrap_or_else(Utc::now), id));
        Ok(true)
    }

    async fn list_failed(&self) -> Result<Vec<TaskEnvelope>, QueueError> {
        let inner = self.inner.lock().unwrap();
        let mut failed = inner.failed.clone();
        failed.sort_by_key(|(at, _)| *at);
        Ok(failed
            .iter()
            .filter_map(|(_, id)| inner.tasks.get(id).cloned())
            .collect())
    }

    async fn requeue_failed(&self, envelope: &TaskEnvelope) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let id = envelope.id();
        let before = inner.failed.len();
        inner.failed.retain(|(_, failed_id)| *failed_id != id);
        if inner.failed.len() == before {
            return Ok(false);
        }
        inner.tasks.insert(id, envelope.clone());
        inner.wait.push_back(id);
        inner.requeued_from_failed.push(id);
        Ok(true)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = Vec::new();
        inner.delayed.retain(|entry| {
            if entry.0 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, _)| *at);
        let promoted = due.len();
        inner.wait.extend(due.into_iter().map(|(_, id)| id));
        Ok(promoted)
    }

    async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let stalled: Vec<Uuid> = inner
            .active
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &stalled {
            inner.active.remove(id);
            inner.wait.push_back(*id);
        }
        Ok(stalled.len())
    }

    async fn prune_failed(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let failed = std::mem::take(&mut inner.failed);
        let (old, keep): (Vec<_>, Vec<_>) = failed.into_iter().partition(|(at, _)| *at < cutoff);
        inner.failed = keep;
        for (_, id) in &old {
            inner.tasks.remove(id);
        }
        Ok(old.len())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(QueueCounts {
            waiting: inner.wait.len() as u64,
            active: inner.active.len() as u64,
            delayed: inner.delayed.len() as u64,
            failed: inner.failed.len() as u64,
        })
    }
}
