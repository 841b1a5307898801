//! Startup recovery sweep: gives every task in the failed set a fresh retry
//! budget, spaced out so a restart does not stampede the scoring service.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::queue::{QueueError, TaskQueue};

/// Requeues all failed tasks with `attempts_made` reset, waiting `spacing`
/// after each actual requeue that is followed by another item. Returns how
/// many were requeued.
pub async fn recover_failed(queue: &dyn TaskQueue, spacing: Duration) -> Result<usize, QueueError> {
    let failed = queue.list_failed().await?;
    if failed.is_empty() {
        info!("No failed tasks to recover");
        return Ok(0);
    }

    let total = failed.len();
    info!(total, "Recovering failed tasks");

    let mut requeued = 0;
    let mut spacing_due = false;
    for mut envelope in failed {
        if spacing_due {
            tokio::time::sleep(spacing).await;
            spacing_due = false;
        }

        let job_id = envelope.id();
        envelope.reset_for_retry();
        match queue.requeue_failed(&envelope).await {
            Ok(true) => {
                requeued += 1;
                spacing_due = true;
                info!(%job_id, "Requeued failed task");
            }
            // Retried through the API or pruned since the listing.
            Ok(false) => debug!(%job_id, "Task already left the failed set"),
            Err(e) => warn!(%job_id, "Failed to requeue task: {e}"),
        }
    }

    info!(requeued, total, "Recovery sweep finished");
    Ok(requeued)
}
