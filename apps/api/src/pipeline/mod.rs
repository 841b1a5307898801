//! Evaluation Pipeline — three strictly sequential stages per task:
//!
//! 1. CV: extract CV text, retrieve role criteria, score → `CvAssessment`
//! 2. Project: extract report text, retrieve the rubric, score → `ProjectAssessment`
//! 3. Summary: decide from the two prior assessments only → `Decision`
//!
//! Every remote call is bounded by `call_timeout`. The first failing stage
//! aborts the rest and becomes the task's single failure cause.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::extract::TextExtractor;
use crate::llm_client::ScoringService;
use crate::models::job::EvaluationResult;
use crate::queue::EvaluationTask;
use crate::retrieval::{context_block, Retriever};

pub mod prompts;
pub mod schema;

use schema::{parse_stage, CvAssessment, Decision, ProjectAssessment, StageOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Cv,
    Project,
    Summary,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Cv => "CV",
            Stage::Project => "project",
            Stage::Summary => "summary",
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} stage: text extraction failed: {cause:#}")]
    Extraction { stage: Stage, cause: anyhow::Error },

    #[error("{stage} stage: reference retrieval failed: {cause:#}")]
    Retrieval { stage: Stage, cause: anyhow::Error },

    #[error("{stage} stage: scoring call failed: {cause:#}")]
    Scoring { stage: Stage, cause: anyhow::Error },

    #[error("{stage} stage: {call} timed out after {}s", .timeout.as_secs())]
    Timeout {
        stage: Stage,
        call: &'static str,
        timeout: Duration,
    },

    #[error("{stage} stage: scorer output rejected: {reason}")]
    InvalidOutput { stage: Stage, reason: String },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Extraction { stage, .. }
            | PipelineError::Retrieval { stage, .. }
            | PipelineError::Scoring { stage, .. }
            | PipelineError::Timeout { stage, .. }
            | PipelineError::InvalidOutput { stage, .. } => *stage,
        }
    }
}

pub struct EvaluationPipeline {
    retriever: Arc<dyn Retriever>,
    scorer: Arc<dyn ScoringService>,
    extractor: Arc<dyn TextExtractor>,
    call_timeout: Duration,
    top_k: usize,
}

impl EvaluationPipeline {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        scorer: Arc<dyn ScoringService>,
        extractor: Arc<dyn TextExtractor>,
        call_timeout: Duration,
        top_k: usize,
    ) -> Self {
        Self {
            retriever,
            scorer,
            extractor,
            call_timeout,
            top_k,
        }
    }

    pub async fn run(&self, task: &EvaluationTask) -> Result<EvaluationResult, PipelineError> {
        let cv = self.cv_stage(task).await?;
        info!(job_id = %task.job_id, cv_match_rate = cv.cv_match_rate, "CV stage complete");

        let project = self.project_stage(task).await?;
        info!(job_id = %task.job_id, project_score = project.project_score, "Project stage complete");

        let decision = self.summary_stage(task, &cv, &project).await?;
        info!(job_id = %task.job_id, is_accepted = decision.is_accepted, "Summary stage complete");

        Ok(schema::merge(cv, project, decision))
    }

    async fn cv_stage(&self, task: &EvaluationTask) -> Result<CvAssessment, PipelineError> {
        let stage = Stage::Cv;
        let cv_text = self
            .bounded(stage, "text extraction", self.extractor.extract(&task.cv))
            .await?
            .map_err(|cause| PipelineError::Extraction { stage, cause })?;
        let references = self
            .references(stage, &prompts::cv_retrieval_query(&task.job_title))
            .await?;

        let user = prompts::cv_user(&task.job_title, &cv_text, &references);
        self.score(stage, &prompts::cv_system(), &user, prompts::CV_TEMPERATURE)
            .await
    }

    async fn project_stage(
        &self,
        task: &EvaluationTask,
    ) -> Result<ProjectAssessment, PipelineError> {
        let stage = Stage::Project;
        let project_text = self
            .bounded(
                stage,
                "text extraction",
                self.extractor.extract(&task.project_report),
            )
            .await?
            .map_err(|cause| PipelineError::Extraction { stage, cause })?;
        let references = self
            .references(stage, prompts::PROJECT_RETRIEVAL_QUERY)
            .await?;

        let user = prompts::project_user(&project_text, &references);
        self.score(
            stage,
            &prompts::project_system(),
            &user,
            prompts::PROJECT_TEMPERATURE,
        )
        .await
    }

    async fn summary_stage(
        &self,
        task: &EvaluationTask,
        cv: &CvAssessment,
        project: &ProjectAssessment,
    ) -> Result<Decision, PipelineError> {
        let stage = Stage::Summary;
        let user = prompts::summary_user(
            &task.job_title,
            &encode_prior(stage, cv)?,
            &encode_prior(stage, project)?,
        );
        self.score(
            stage,
            &prompts::summary_system(),
            &user,
            prompts::SUMMARY_TEMPERATURE,
        )
        .await
    }

    async fn references(&self, stage: Stage, query: &str) -> Result<String, PipelineError> {
        let passages = self
            .bounded(stage, "reference retrieval", self.retriever.query(query, self.top_k))
            .await?
            .map_err(|cause| PipelineError::Retrieval { stage, cause })?;
        Ok(context_block(&passages))
    }

    async fn score<T: StageOutput>(
        &self,
        stage: Stage,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> Result<T, PipelineError> {
        let raw = self
            .bounded(
                stage,
                "scoring call",
                self.scorer.complete(system, user, temperature),
            )
            .await?
            .map_err(|cause| PipelineError::Scoring { stage, cause })?;
        parse_stage(&raw).map_err(|reason| PipelineError::InvalidOutput { stage, reason })
    }

    async fn bounded<F: Future>(
        &self,
        stage: Stage,
        call: &'static str,
        fut: F,
    ) -> Result<F::Output, PipelineError> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| PipelineError::Timeout {
                stage,
                call,
                timeout: self.call_timeout,
            })
    }
}

fn encode_prior<T: StageOutput>(stage: Stage, value: &T) -> Result<String, PipelineError> {
    serde_json::to_string(value).map_err(|e| PipelineError::InvalidOutput {
        stage,
        reason: format!("could not encode prior assessment: {e}"),
    })
}
