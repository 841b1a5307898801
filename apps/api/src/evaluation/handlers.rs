use axum::{
    extract::{rejection::JsonRejection, Multipart, Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::validation::{parse_job_id, EvaluateRequest};
use crate::errors::AppError;
use crate::evaluation::upload::read_upload_pair;
use crate::models::file::FileSummary;
use crate::models::job::Job;
use crate::queue::EvaluationTask;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub cv: FileSummary,
    pub project: FileSummary,
}

/// POST /upload
///
/// Both parts are validated before either is stored. If storing the project
/// fails, the already stored CV is discarded.
pub async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let pair = read_upload_pair(&mut multipart, state.registry.max_bytes()).await?;
    state.registry.validate(&pair.cv)?;
    state.registry.validate(&pair.project)?;

    let cv = state.registry.register(pair.cv).await?;
    let project = match state.registry.register(pair.project).await {
        Ok(project) => project,
        Err(e) => {
            warn!(file_id = %cv.id, "Project upload failed, discarding CV: {e}");
            state.registry.discard(&cv).await;
            return Err(e.into());
        }
    };

    Ok(Json(UploadResponse {
        cv: FileSummary::from(&cv),
        project: FileSummary::from(&project),
    }))
}

/// POST /evaluate
pub async fn handle_evaluate(
    State(state): State<AppState>,
    body: Result<Json<EvaluateRequest>, JsonRejection>,
) -> Result<Json<Job>, AppError> {
    let Json(req) = body.map_err(|e| {
        AppError::Validation(format!("Invalid request parameters: {}", e.body_text()))
    })?;
    let admitted = req.validate()?;

    let cv = state.registry.resolve(admitted.cv_id).await?;
    let project_report = state.registry.resolve(admitted.project_report_id).await?;
    let (Some(cv), Some(project_report)) = (cv, project_report) else {
        return Err(AppError::NotFound("File not found".to_string()));
    };

    let mut job = Job::queued(Uuid::new_v4());
    state.store.put_job(&job).await?;

    let task = EvaluationTask {
        job_id: job.id,
        job_title: admitted.job_title,
        cv,
        project_report,
    };
    if let Err(e) = state.queue.enqueue(task).await {
        // Leave no job that claims to be queued but never will run.
        job.fail("Evaluation could not be queued");
        if let Err(store_err) = state.store.put_job(&job).await {
            error!(job_id = %job.id, "Failed to record enqueue failure: {store_err}");
        }
        return Err(e.into());
    }

    info!(job_id = %job.id, "Evaluation queued");
    Ok(Json(job))
}

/// GET /result/:id
pub async fn handle_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let id = parse_job_id(&id)?;
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Job not found".to_string()))?;
    Ok(Json(job))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTaskView {
    pub job_id: Uuid,
    pub job_title: String,
    pub attempts_made: u32,
    pub last_error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// GET /queue/failed
pub async fn handle_list_failed(
    State(state): State<AppState>,
) -> Result<Json<Vec<FailedTaskView>>, AppError> {
    let failed = state.queue.list_failed().await?;
    Ok(Json(
        failed
            .into_iter()
            .map(|envelope| FailedTaskView {
                job_id: envelope.task.job_id,
                job_title: envelope.task.job_title,
                attempts_made: envelope.attempts_made,
                last_error: envelope.last_error,
                failed_at: envelope.failed_at,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub job_id: Uuid,
    pub requeued: bool,
}

/// POST /queue/failed/:id/retry
pub async fn handle_retry_failed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, AppError> {
    let id = parse_job_id(&id)?;
    let not_found = || AppError::NotFound("Failed task not found".to_string());

    let mut envelope = state
        .queue
        .list_failed()
        .await?
        .into_iter()
        .find(|envelope| envelope.id() == id)
        .ok_or_else(not_found)?;

    envelope.reset_for_retry();
    if !state.queue.requeue_failed(&envelope).await? {
        warn!(job_id = %id, "Failed task left the failed set before it could be retried");
        return Err(not_found());
    }

    info!(job_id = %id, "Failed task requeued manually");
    Ok(Json(RetryResponse {
        job_id: id,
        requeued: true,
    }))
}
