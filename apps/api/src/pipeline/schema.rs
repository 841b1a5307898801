//! Stage output contracts. A reply that parses but breaks a contract is
//! rejected rather than clamped.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::models::job::EvaluationResult;

/// Output contract of one stage.
pub trait StageOutput: DeserializeOwned + Serialize {
    fn check(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvAssessment {
    pub cv_match_rate: f64,
    pub cv_feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectAssessment {
    pub project_score: f64,
    pub project_feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub overall_summary: String,
    pub is_accepted: bool,
}

impl StageOutput for CvAssessment {
    fn check(&self) -> Result<(), String> {
        in_range("cv_match_rate", self.cv_match_rate, 0.0, 1.0)?;
        non_empty("cv_feedback", &self.cv_feedback)
    }
}

impl StageOutput for ProjectAssessment {
    fn check(&self) -> Result<(), String> {
        in_range("project_score", self.project_score, 1.0, 5.0)?;
        non_empty("project_feedback", &self.project_feedback)
    }
}

impl StageOutput for Decision {
    fn check(&self) -> Result<(), String> {
        non_empty("overall_summary", &self.overall_summary)
    }
}

/// Parses and checks a raw scorer reply.
pub fn parse_stage<T: StageOutput>(raw: &str) -> Result<T, String> {
    let value: T = serde_json::from_str(raw.trim()).map_err(|e| format!("malformed JSON: {e}"))?;
    value.check()?;
    Ok(value)
}

fn in_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), String> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(format!("{field} {value} is outside [{min}, {max}]"))
    }
}

fn non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} is empty"))
    } else {
        Ok(())
    }
}

pub fn merge(cv: CvAssessment, project: ProjectAssessment, decision: Decision) -> EvaluationResult {
    EvaluationResult {
        cv_match_rate: cv.cv_match_rate,
        cv_feedback: cv.cv_feedback,
        project_score: project.project_score,
        project_feedback: project.project_feedback,
        overall_summary: decision.overall_summary,
        is_accepted: decision.is_accepted,
    }
}
