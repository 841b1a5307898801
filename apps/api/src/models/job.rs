use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Merged output of the three pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub cv_match_rate: f64,
    pub cv_feedback: String,
    pub project_score: f64,
    pub project_feedback: String,
    pub overall_summary: String,
    pub is_accepted: bool,
}

/// Lifecycle record of one evaluation request.
///
/// Status changes go through the transition methods below, which keep
/// `result` present only when completed and `error` present only when failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Total attempts started across the job's lifetime. Never decreases.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<EvaluationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn queued(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            attempts: 0,
            result: None,
            error: None,
        }
    }

    /// queued|failed -> processing. Counts a new attempt.
    pub fn begin_attempt(&mut self) {
        self.status = JobStatus::Processing;
        self.attempts = self.attempts.saturating_add(1);
        self.result = None;
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, result: EvaluationResult) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, cause: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.result = None;
        self.error = Some(cause.into());
        self.updated_at = Utc::now();
    }
}
