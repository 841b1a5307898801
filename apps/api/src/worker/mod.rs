//! Worker Pool — consumes the Job Queue and drives the Evaluation Pipeline.
//!
//! Per task: mark the job `processing` before any remote call, run the
//! pipeline, then record `completed` (and acknowledge) or record `failed`
//! and hand the task back to the queue's retry policy. A pipeline failure
//! never escapes the loop. The lease is renewed while the pipeline runs; if
//! it is lost, the run is abandoned and the task left to its new holder.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::models::job::{EvaluationResult, Job, JobStatus};
use crate::pipeline::{EvaluationPipeline, PipelineError};
use crate::queue::{settle_failure, FailureOutcome, QueueError, RetryPolicy, TaskEnvelope, TaskQueue};
use crate::store::StateStore;

pub mod recovery;

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(100);

/// What happened to one reserved task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Retrying { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
    /// Redelivered after its job had already completed; acknowledged without rerunning.
    AlreadyCompleted,
    /// The lease was reclaimed mid-run; another worker owns the task now.
    LeaseLost,
}

impl From<FailureOutcome> for TaskOutcome {
    fn from(outcome: FailureOutcome) -> Self {
        match outcome {
            FailureOutcome::Retrying { attempt, delay } => TaskOutcome::Retrying { attempt, delay },
            FailureOutcome::Exhausted { attempts } => TaskOutcome::Exhausted { attempts },
            FailureOutcome::LeaseLost => TaskOutcome::LeaseLost,
        }
    }
}

#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    store: StateStore,
    pipeline: Arc<EvaluationPipeline>,
    policy: RetryPolicy,
    lease: Duration,
    renew_every: Duration,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        store: StateStore,
        pipeline: Arc<EvaluationPipeline>,
        config: &Config,
    ) -> Self {
        Self {
            queue,
            store,
            pipeline,
            policy: RetryPolicy::new(config.max_attempts, config.backoff_base),
            lease: config.task_lease,
            renew_every: (config.task_lease / 3).max(MIN_RENEW_INTERVAL),
            poll_interval: config.queue_poll_interval,
        }
    }

    /// Reserves and processes at most one task. `Ok(None)` when the queue is idle.
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>, QueueError> {
        let Some(envelope) = self.queue.reserve(self.lease).await? else {
            return Ok(None);
        };
        self.process(envelope).await.map(Some)
    }

    async fn process(&self, envelope: TaskEnvelope) -> Result<TaskOutcome, QueueError> {
        let job_id = envelope.id();

        let mut job = match self.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            // Record expired while the task waited; recreate it so polling works again.
            Ok(None) => Job::queued(job_id),
            Err(e) => {
                // The stored record is unknown, so it is left as is.
                let cause = format!("State store unavailable: {e}");
                warn!(%job_id, "{cause}");
                let outcome =
                    settle_failure(self.queue.as_ref(), &self.policy, envelope, &cause).await?;
                return Ok(outcome.into());
            }
        };

        if job.status == JobStatus::Completed {
            info!(%job_id, "Job already completed, acknowledging redelivered task");
            self.queue.complete(&envelope).await?;
            return Ok(TaskOutcome::AlreadyCompleted);
        }

        job.begin_attempt();
        if let Err(e) = self.store.put_job(&job).await {
            let cause = format!("State store unavailable: {e}");
            return self.fail(envelope, job, cause).await;
        }
        info!(%job_id, attempt = job.attempts, "Processing evaluation");

        let Some(outcome) = self.run_leased(&envelope).await else {
            warn!(%job_id, "Lease was reclaimed mid-run, abandoning this attempt");
            return Ok(TaskOutcome::LeaseLost);
        };

        match outcome {
            Ok(result) => {
                job.complete(result);
                if let Err(e) = self.store.put_job(&job).await {
                    let cause = format!("Failed to record result: {e}");
                    return self.fail(envelope, job, cause).await;
                }
                if !self.queue.complete(&envelope).await? {
                    warn!(%job_id, "Result recorded, but the task is held under another lease");
                    return Ok(TaskOutcome::LeaseLost);
                }
                info!(%job_id, attempt = job.attempts, "Evaluation completed");
                Ok(TaskOutcome::Completed)
            }
            Err(e) => {
                let cause = e.to_string();
                warn!(%job_id, stage = %e.stage(), "Evaluation failed: {cause}");
                self.fail(envelope, job, cause).await
            }
        }
    }

    /// Runs the pipeline while renewing the lease. `None` once the lease is
    /// lost; the in-flight pipeline is dropped.
    async fn run_leased(
        &self,
        envelope: &TaskEnvelope,
    ) -> Option<Result<EvaluationResult, PipelineError>> {
        let run = self.pipeline.run(&envelope.task);
        tokio::pin!(run);
        let mut renew = tokio::time::interval(self.renew_every);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        renew.tick().await;

        loop {
            tokio::select! {
                outcome = &mut run => return Some(outcome),
                _ = renew.tick() => match self.queue.renew_lease(envelope, self.lease).await {
                    Ok(true) => debug!(job_id = %envelope.id(), "Lease renewed"),
                    Ok(false) => return None,
                    Err(e) => warn!(job_id = %envelope.id(), "Lease renewal failed: {e}"),
                },
            }
        }
    }

    /// Records the failure on the job, then lets the retry policy decide.
    async fn fail(
        &self,
        envelope: TaskEnvelope,
        mut job: Job,
        cause: String,
    ) -> Result<TaskOutcome, QueueError> {
        job.fail(cause.clone());
        if let Err(e) = self.store.put_job(&job).await {
            error!(job_id = %job.id, "Failed to record job failure: {e}");
        }
        let outcome = settle_failure(self.queue.as_ref(), &self.policy, envelope, &cause).await?;
        Ok(outcome.into())
    }

    /// Polls until `shutdown` fires. Queue errors are logged and retried on the
    /// next tick; the task in hand stays leased and is redelivered if lost.
    pub async fn run(self, name: String, shutdown: CancellationToken) {
        info!(worker = %name, "Worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(Some(outcome)) => {
                    debug!(worker = %name, ?outcome, "Task settled");
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(worker = %name, "Queue error: {e}");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!(worker = %name, "Worker shutting down");
    }
}

/// Starts `concurrency` workers sharing one queue.
pub fn spawn_pool(
    worker: Worker,
    concurrency: usize,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let group = format!("evaluator-{}", std::process::id());
    (0..concurrency.max(1))
        .map(|i| {
            let name = format!("{group}-w{i}");
            tokio::spawn(worker.clone().run(name, shutdown.clone()))
        })
        .collect()
}

/// Periodic queue housekeeping: promotes due retries, reclaims expired
/// leases and prunes failed tasks past retention.
pub fn spawn_maintenance(
    queue: Arc<dyn TaskQueue>,
    config: &Config,
    shutdown: &CancellationToken,
) -> JoinHandle<()> {
    let interval = config.queue_poll_interval;
    let retention = chrono::Duration::from_std(config.failed_retention)
        .unwrap_or_else(|_| chrono::Duration::days(7));
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Queue maintenance shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let now = Utc::now();
                    match queue.promote_due(now).await {
                        Ok(0) => {}
                        Ok(n) => debug!(promoted = n, "Promoted delayed tasks"),
                        Err(e) => warn!("promote_due failed: {e}"),
                    }
                    match queue.requeue_stalled(now).await {
                        Ok(0) => {}
                        Ok(n) => warn!(requeued = n, "Requeued tasks with expired leases"),
                        Err(e) => warn!("requeue_stalled failed: {e}"),
                    }
                    match queue.prune_failed(now - retention).await {
                        Ok(0) => {}
                        Ok(n) => info!(pruned = n, "Pruned failed tasks past retention"),
                        Err(e) => warn!("prune_failed failed: {e}"),
                    }
                }
            }
        }
    })
}
