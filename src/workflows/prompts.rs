//! Prompt builders for the workflow nodes

use crate::llm::Message;
use crate::pipeline::PipelineState;

pub const PLANNER_SYSTEM: &str = "You are a senior software engineer. \
Write short, concrete implementation plans as numbered steps. Do not write code.";

pub const TEST_WRITER_SYSTEM: &str = "You write focused unit tests. \
The code under test is already in scope: call its functions directly and do not import it. \
Use plain assertions so the file runs as a script. \
Reply with a single fenced code block containing only the tests.";

pub const CODER_SYSTEM: &str = "You write correct, idiomatic code. \
Reply with a single fenced code block containing the complete implementation and nothing else.";

pub const IMPROVER_SYSTEM: &str = "You improve existing code without changing its public behaviour \
unless the issue asks for it. Reply with a single fenced code block containing the full replacement \
for the code you were given and nothing else.";

fn section(out: &mut String, title: &str, body: Option<&str>) {
    if let Some(body) = body.map(str::trim).filter(|b| !b.is_empty()) {
        out.push_str(&format!("\n## {}\n{}\n", title, body));
    }
}

fn fenced(code: &str) -> String {
    format!("```\n{}\n```", code.trim_end())
}

/// Plan for a fresh generation task
pub fn plan_messages(state: &PipelineState) -> Vec<Message> {
    let mut prompt = format!("Task: {}\n", state.task);
    section(&mut prompt, "Relevant code from the project", state.retrieved_context.as_deref());
    prompt.push_str("\nWrite the implementation plan.");

    vec![Message::system(PLANNER_SYSTEM), Message::user(prompt)]
}

/// Tests for the planned implementation
pub fn tests_messages(state: &PipelineState) -> Vec<Message> {
    let mut prompt = format!("Task: {}\n", state.task);
    section(&mut prompt, "Plan", state.plan.as_deref());
    section(&mut prompt, "Relevant code from the project", state.retrieved_context.as_deref());
    prompt.push_str("\nWrite unit tests for this task.");

    vec![Message::system(TEST_WRITER_SYSTEM), Message::user(prompt)]
}

/// Implementation that should pass the generated tests
pub fn code_messages(state: &PipelineState) -> Vec<Message> {
    let mut prompt = format!("Task: {}\n", state.task);
    section(&mut prompt, "Plan", state.plan.as_deref());
    section(&mut prompt, "Relevant code from the project", state.retrieved_context.as_deref());
    if let Some(tests) = state.tests.as_deref().filter(|t| !t.trim().is_empty()) {
        prompt.push_str(&format!("\n## Tests the code must pass\n{}\n", fenced(tests)));
    }
    prompt.push_str("\nWrite the implementation.");

    vec![Message::system(CODER_SYSTEM), Message::user(prompt)]
}

fn improvement_header(state: &PipelineState) -> String {
    let target = state.target_path.as_deref().unwrap_or("(unnamed)");
    let mut header = format!("File: {}\nIssue: {}\n", target, state.query_text());
    if let Some(range) = state.selection {
        header.push_str(&format!("Only lines {} are being changed.\n", range));
    }
    header
}

/// Plan for an improvement
pub fn improve_plan_messages(state: &PipelineState) -> Vec<Message> {
    let mut prompt = improvement_header(state);
    if let Some(code) = state.original_code.as_deref() {
        prompt.push_str(&format!("\n## Code to improve\n{}\n", fenced(code)));
    }
    section(&mut prompt, "Project structure", state.project_structure.as_deref());
    section(&mut prompt, "Related files", state.related_context.as_deref());
    section(&mut prompt, "Relevant code from the project", state.retrieved_context.as_deref());
    prompt.push_str("\nWrite a short plan for the change.");

    vec![Message::system(PLANNER_SYSTEM), Message::user(prompt)]
}

/// Improved code; on a retry the previous diagnostic and error-focused context are included
pub fn improve_code_messages(state: &PipelineState) -> Vec<Message> {
    let mut prompt = improvement_header(state);
    if let Some(code) = state.original_code.as_deref() {
        prompt.push_str(&format!("\n## Code to improve\n{}\n", fenced(code)));
    }
    section(&mut prompt, "Plan", state.plan.as_deref());
    section(&mut prompt, "Related files", state.related_context.as_deref());
    section(&mut prompt, "Relevant code from the project", state.retrieved_context.as_deref());

    if state.retry_count > 0 {
        if let Some(previous) = state.code.as_deref() {
            prompt.push_str(&format!("\n## Your previous attempt\n{}\n", fenced(previous)));
        }
        section(&mut prompt, "It failed validation with", state.validation_output.as_deref());
        section(&mut prompt, "Code related to this error", state.error_context.as_deref());
        prompt.push_str(&format!(
            "\nThis is retry {} of {}. Fix the failure.",
            state.retry_count, state.max_retries
        ));
    } else {
        prompt.push_str("\nWrite the improved code.");
    }

    vec![Message::system(IMPROVER_SYSTEM), Message::user(prompt)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::LineRange;

    #[test]
    fn test_code_prompt_includes_upstream_outputs() {
        let mut state = PipelineState::new("add two numbers");
        state.plan = Some("1. define add".into());
        state.tests = Some("assert add(1, 2) == 3".into());
        state.retrieved_context = Some(String::new());

        let messages = code_messages(&state);
        let prompt = &messages[1].content;
        assert!(prompt.contains("1. define add"));
        assert!(prompt.contains("assert add(1, 2) == 3"));
        assert!(!prompt.contains("Relevant code"));
    }

    #[test]
    fn test_retry_prompt_carries_diagnostic() {
        let mut state = PipelineState::new("");
        state.issue = Some("handle empty input".into());
        state.target_path = Some("src/util.py".into());
        state.selection = Some(LineRange::new(3, 9));
        state.original_code = Some("def f(x): return x[0]".into());

        let first = improve_code_messages(&state);
        assert!(!first[1].content.contains("failed validation"));

        state.retry_count = 1;
        state.max_retries = 2;
        state.code = Some("def f(x: return".into());
        state.validation_output = Some("line 1: unclosed '('".into());
        state.error_context = Some("def g(x): ...".into());

        let retry = improve_code_messages(&state);
        let prompt = &retry[1].content;
        assert!(prompt.contains("Only lines 3-9"));
        assert!(prompt.contains("unclosed '('"));
        assert!(prompt.contains("def g(x)"));
        assert!(prompt.contains("retry 1 of 2"));
    }
}
