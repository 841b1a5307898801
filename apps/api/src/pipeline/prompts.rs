// Prompt constants for the three evaluation stages.
// Reuses cross-cutting fragments from llm_client::prompts.

use crate::llm_client::prompts::{system_prompt, REFERENCE_GROUNDING_INSTRUCTION};

pub const CV_TEMPERATURE: f32 = 0.0;
pub const PROJECT_TEMPERATURE: f32 = 0.0;
pub const SUMMARY_TEMPERATURE: f32 = 0.1;

/// Minimum passing grades quoted to the decision stage.
pub const CV_PASSING_GRADE: f64 = 0.5;
pub const PROJECT_PASSING_GRADE: f64 = 3.0;

const CV_ROLE: &str = "You are a technical recruiter scoring CVs against a role.";
const CV_SCHEMA: &str = r#"Respond with a JSON object using this EXACT schema:
{
  "cv_match_rate": number between 0 and 1 (how well the CV matches the role),
  "cv_feedback": "One sentence summary of the overall assessment"
}"#;

const PROJECT_ROLE: &str = "You are a senior engineer evaluating a candidate's take-home project.";
const PROJECT_SCHEMA: &str = r#"Respond with a JSON object using this EXACT schema:
{
  "project_score": number between 1 and 5 (overall project quality),
  "project_feedback": "One sentence summary of the overall assessment"
}"#;

const SUMMARY_ROLE: &str = "You are a hiring manager deciding whether to advance a candidate.";

pub fn cv_retrieval_query(job_title: &str) -> String {
    format!("CV evaluation criteria and job requirements for the {job_title} role")
}

pub const PROJECT_RETRIEVAL_QUERY: &str =
    "Project evaluation rubric and case study brief requirements";

pub fn cv_system() -> String {
    system_prompt(
        &format!("{CV_ROLE} {REFERENCE_GROUNDING_INSTRUCTION}"),
        CV_SCHEMA,
    )
}

pub fn cv_user(job_title: &str, cv_text: &str, references: &str) -> String {
    format!("Job Title: {job_title}\n\nCandidate CV:\n{cv_text}\n\nReference Documents:\n{references}")
}

pub fn project_system() -> String {
    system_prompt(
        &format!("{PROJECT_ROLE} {REFERENCE_GROUNDING_INSTRUCTION}"),
        PROJECT_SCHEMA,
    )
}

pub fn project_user(project_text: &str, references: &str) -> String {
    format!("Candidate Project:\n{project_text}\n\nReference Documents:\n{references}")
}

pub fn summary_system() -> String {
    let schema = format!(
        r#"Analyze the CV and project assessments provided. Minimum passing grade is {CV_PASSING_GRADE} for the CV and {PROJECT_PASSING_GRADE} for the project.
Respond with a JSON object using this EXACT schema:
{{
  "overall_summary": "3 to 5 sentence summary of the candidate's fit for the role",
  "is_accepted": boolean (true if the candidate is a good fit)
}}"#
    );
    system_prompt(SUMMARY_ROLE, &schema)
}

/// Built from the two prior structured outputs only, never the source documents.
pub fn summary_user(job_title: &str, cv_json: &str, project_json: &str) -> String {
    format!("Job Title: {job_title}\n\nCV assessment: {cv_json}\nProject assessment: {project_json}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_system_quotes_passing_grades() {
        let prompt = summary_system();
        assert!(prompt.contains("0.5 for the CV"));
        assert!(prompt.contains("3 for the project"));
        assert!(prompt.contains("\"is_accepted\""));
    }

    #[test]
    fn test_cv_query_names_the_role() {
        assert!(cv_retrieval_query("Backend Engineer").contains("Backend Engineer"));
    }
}
