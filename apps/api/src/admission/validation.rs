//! Request-shape checks for the evaluate and result endpoints.

use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;

const JOB_TITLE_MIN: usize = 3;
const JOB_TITLE_MAX: usize = 100;

/// Raw body of `POST /evaluate`. Fields are optional here so that missing
/// fields are reported by `validate` alongside every other problem.
#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub job_title: Option<String>,
    pub cv_id: Option<String>,
    pub project_report_id: Option<String>,
}

/// An evaluate request that passed shape validation.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedEvaluation {
    pub job_title: String,
    pub cv_id: Uuid,
    pub project_report_id: Uuid,
}

impl EvaluateRequest {
    pub fn validate(self) -> Result<AdmittedEvaluation, AppError> {
        let mut problems = Vec::new();

        let job_title = match self.job_title.as_deref().map(str::trim) {
            None | Some("") => {
                problems.push("job_title is required".to_string());
                None
            }
            Some(title) => {
                let len = title.chars().count();
                if !(JOB_TITLE_MIN..=JOB_TITLE_MAX).contains(&len) {
                    problems.push(format!(
                        "job_title must be between {JOB_TITLE_MIN} and {JOB_TITLE_MAX} characters"
                    ));
                    None
                } else {
                    Some(title.to_string())
                }
            }
        };
        let cv_id = required_uuid("cv_id", self.cv_id.as_deref(), &mut problems);
        let project_report_id = required_uuid(
            "project_report_id",
            self.project_report_id.as_deref(),
            &mut problems,
        );

        match (job_title, cv_id, project_report_id) {
            (Some(job_title), Some(cv_id), Some(project_report_id)) if problems.is_empty() => {
                Ok(AdmittedEvaluation {
                    job_title,
                    cv_id,
                    project_report_id,
                })
            }
            _ => Err(AppError::Validation(format!(
                "Invalid request parameters: {}",
                problems.join("; ")
            ))),
        }
    }
}

fn required_uuid(field: &str, raw: Option<&str>, problems: &mut Vec<String>) -> Option<Uuid> {
    match raw.map(str::trim) {
        None | Some("") => {
            problems.push(format!("{field} is required"));
            None
        }
        Some(value) => match Uuid::parse_str(value) {
            Ok(id) => Some(id),
            Err(_) => {
                problems.push(format!("{field} must be a valid UUID"));
                None
            }
        },
    }
}

/// Parses the `:id` path segment of `/result/:id`.
pub fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::Validation("Invalid job ID format".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(title: Option<&str>, cv: Option<&str>, project: Option<&str>) -> EvaluateRequest {
        EvaluateRequest {
            job_title: title.map(String::from),
            cv_id: cv.map(String::from),
            project_report_id: project.map(String::from),
        }
    }

    #[test]
    fn test_valid_request_is_admitted() {
        let cv = Uuid::new_v4();
        let project = Uuid::new_v4();
        let admitted = request(
            Some("  Backend Engineer "),
            Some(&cv.to_string()),
            Some(&project.to_string()),
        )
        .validate()
        .unwrap();
        assert_eq!(admitted.job_title, "Backend Engineer");
        assert_eq!(admitted.cv_id, cv);
        assert_eq!(admitted.project_report_id, project);
    }

    #[test]
    fn test_missing_fields_are_all_reported() {
        let err = request(None, None, None).validate().unwrap_err();
        let AppError::Validation(message) = err else {
            panic!("expected validation error");
        };
        assert!(message.contains("job_title is required"));
        assert!(message.contains("cv_id is required"));
        assert!(message.contains("project_report_id is required"));
    }

    #[test]
    fn test_job_title_length_bounds() {
        let id = Uuid::new_v4().to_string();
        assert!(request(Some("ab"), Some(&id), Some(&id)).validate().is_err());
        assert!(request(Some("abc"), Some(&id), Some(&id)).validate().is_ok());
        let long = "x".repeat(101);
        assert!(request(Some(&long), Some(&id), Some(&id)).validate().is_err());
    }

    #[test]
    fn test_malformed_uuid_rejected() {
        let id = Uuid::new_v4().to_string();
        let err = request(Some("Backend Engineer"), Some("not-a-uuid"), Some(&id))
            .validate()
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(m) if m.contains("cv_id must be a valid UUID")));
    }

    #[test]
    fn test_parse_job_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_job_id(&id.to_string()).unwrap(), id);
        assert!(matches!(parse_job_id("123"), Err(AppError::Validation(_))));
    }
}
