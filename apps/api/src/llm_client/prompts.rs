// Cross-cutting prompt fragments shared by every scoring call.
// Stage-specific prompts live in pipeline::prompts.

/// Appended to every system prompt: the pipeline parses the reply as JSON.
pub const JSON_ONLY_INSTRUCTION: &str = "You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Keeps scores tied to the retrieved reference passages.
pub const REFERENCE_GROUNDING_INSTRUCTION: &str = "\
    Base your judgement on the Reference Documents provided. \
    Do NOT reward skills or claims that the candidate material does not show.";

/// Joins a role description with the shared instructions into one system prompt.
pub fn system_prompt(role: &str, schema: &str) -> String {
    format!("{role}\n\n{schema}\n\n{JSON_ONLY_INSTRUCTION}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_ends_with_json_instruction() {
        let prompt = system_prompt("You are a recruiter.", "{\"a\": number}");
        assert!(prompt.starts_with("You are a recruiter."));
        assert!(prompt.contains("{\"a\": number}"));
        assert!(prompt.ends_with(JSON_ONLY_INSTRUCTION));
    }
}
