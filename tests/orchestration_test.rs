//! Orchestration Integration Tests
//!
//! Drives the public workflows and the agent loop with scripted backends.

use anyhow::Result;
use async_trait::async_trait;
use codeforge::agent::{AgentConfig, AgentLoop, AgentRequest, ToolExecutor, ToolMode};
use codeforge::llm::{Completion, Message, ModelChain, ModelPort, TextStream};
use codeforge::pipeline::{EventTag, LineRange, PipelineLimits, StreamEvent};
use codeforge::router::KeywordModelSelector;
use codeforge::sandbox::{SandboxValidator, ValidatorConfig};
use codeforge::workflows::prompts::{CODER_SYSTEM, IMPROVER_SYSTEM, PLANNER_SYSTEM, TEST_WRITER_SYSTEM};
use codeforge::workflows::{CodeGenWorkflow, ImproveRequest, ImproveWorkflow, Services};
use codeforge::workspace::LocalWorkspace;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

/// Backend that answers by system prompt. Coder replies are consumed in
/// order; the last one repeats.
#[derive(Default)]
struct ScriptedModel {
    coder: Mutex<VecDeque<String>>,
    last_coder: Mutex<String>,
    /// Model ids that always fail
    failing: Vec<String>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl ScriptedModel {
    fn with_code(replies: &[&str]) -> Self {
        Self {
            coder: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            ..Default::default()
        }
    }

    fn failing_on(mut self, model: &str) -> Self {
        self.failing.push(model.to_string());
        self
    }

    fn attempts(&self, model: &str) -> usize {
        self.attempts.lock().get(model).copied().unwrap_or(0)
    }

    fn reply(&self, messages: &[Message], model: &str) -> Result<String> {
        *self.attempts.lock().entry(model.to_string()).or_insert(0) += 1;
        if self.failing.iter().any(|m| m == model) {
            anyhow::bail!("model '{}' not found", model);
        }

        let system = messages.first().map(|m| m.content.as_str()).unwrap_or_default();
        let reply = if system == PLANNER_SYSTEM {
            "1. Write the function\n2. Return the result".to_string()
        } else if system == TEST_WRITER_SYSTEM {
            "```python\nassert add(2, 3) == 5\n```".to_string()
        } else if system.starts_with(CODER_SYSTEM) || system == IMPROVER_SYSTEM {
            let mut last = self.last_coder.lock();
            if let Some(next) = self.coder.lock().pop_front() {
                *last = next;
            }
            last.clone()
        } else {
            "ok".to_string()
        };
        Ok(reply)
    }
}

#[async_trait]
impl ModelPort for ScriptedModel {
    async fn generate(&self, messages: &[Message], model: &str, _temperature: f32) -> Result<Completion> {
        let content = self.reply(messages, model)?;
        Ok(Completion {
            content,
            model: model.to_string(),
        })
    }

    async fn generate_stream(&self, messages: &[Message], model: &str, _temperature: f32) -> Result<TextStream> {
        let content = self.reply(messages, model)?;
        let chunks: Vec<Result<String>> = content
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(String::from_utf8_lossy(c).into_owned()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

const ADD_FN: &str = "```python\ndef add(a, b):\n    return a + b\n```";
const BROKEN_ADD_FN: &str = "```python\ndef add(a, b:\n    return a + b\n```";

fn services(model: Arc<ScriptedModel>) -> Services {
    Services::new(
        model,
        Arc::new(KeywordModelSelector::single("primary", "fallback")),
        Arc::new(SandboxValidator::new(ValidatorConfig::static_only())),
    )
}

fn workspace_with(file: &str, content: &str) -> (TempDir, Arc<LocalWorkspace>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    std::fs::write(dir.path().join(file), content).expect("Failed to seed file");
    let files = Arc::new(LocalWorkspace::new(dir.path()));
    (dir, files)
}

#[tokio::test]
async fn test_generation_passes_first_time() {
    let model = Arc::new(ScriptedModel::with_code(&[ADD_FN]));
    let workflow = CodeGenWorkflow::new(services(model), PipelineLimits::default()).unwrap();

    let state = workflow.run("write a function that adds two numbers", None).await.unwrap();

    assert_eq!(state.validation_passed, Some(true));
    assert_eq!(state.retry_count, 0);
    assert!(state.code.as_deref().unwrap().contains("def add"));
    assert!(state.tests.as_deref().unwrap().contains("assert add"));
}

#[tokio::test]
async fn test_improvement_recovers_after_syntax_error() {
    let (dir, files) = workspace_with("calc.py", "def add(a, b):\n    return a - b\n");
    let model = Arc::new(ScriptedModel::with_code(&[BROKEN_ADD_FN, ADD_FN]));
    let workflow = ImproveWorkflow::new(services(model), files, PipelineLimits::default()).unwrap();

    let request = ImproveRequest::new("calc.py", "add subtracts instead of adding").with_max_retries(2);
    let state = workflow.run(request, None).await.unwrap();

    assert_eq!(state.retry_count, 1);
    assert_eq!(state.validation_passed, Some(true));
    assert_eq!(state.code_attempts, 2);
    assert_eq!(
        state.proposed_full_content.as_deref(),
        Some("def add(a, b):\n    return a + b\n")
    );
    // auto-write is off: the proposal never touches disk
    assert!(!state.written);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("calc.py")).unwrap(),
        "def add(a, b):\n    return a - b\n"
    );
}

#[tokio::test]
async fn test_retry_budget_is_respected() {
    for max_retries in [0u32, 1, 3] {
        let (_dir, files) = workspace_with("calc.py", "def add(a, b):\n    return a - b\n");
        let model = Arc::new(ScriptedModel::with_code(&[BROKEN_ADD_FN]));
        let workflow = ImproveWorkflow::new(services(model), files, PipelineLimits::default()).unwrap();

        let request = ImproveRequest::new("calc.py", "fix add").with_max_retries(max_retries);
        let state = workflow.run(request, None).await.unwrap();

        assert_eq!(state.validation_passed, Some(false));
        assert_eq!(state.retry_count, max_retries);
        assert!(state.code_attempts <= max_retries + 1);
        assert!(state.last_error.is_some());
        // a failed run still carries the last attempt
        assert!(state.proposed_full_content.as_deref().unwrap().contains("def add(a, b:"));
    }
}

#[tokio::test]
async fn test_generation_validated_by_real_interpreter() {
    let has_python = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !has_python {
        eprintln!("python3 not found, skipping");
        return;
    }

    let model = Arc::new(ScriptedModel::with_code(&[ADD_FN]));
    let services = Services::new(
        model,
        Arc::new(KeywordModelSelector::single("primary", "fallback")),
        Arc::new(SandboxValidator::default()),
    );
    let workflow = CodeGenWorkflow::new(services, PipelineLimits::default()).unwrap();

    let state = workflow.run("write a function that adds two numbers", None).await.unwrap();

    let outcome = state.validation.as_ref().expect("validation ran");
    assert_eq!(state.validation_passed, Some(true), "{}", outcome.diagnostic);
    assert_eq!(state.retry_count, 0);
}

#[tokio::test]
async fn test_retry_budget_beyond_default_step_limit() {
    let max_retries = 11u32;
    assert!(3 * max_retries as usize > PipelineLimits::default().step_limit);

    let (_dir, files) = workspace_with("calc.py", "def add(a, b):\n    return a - b\n");
    let model = Arc::new(ScriptedModel::with_code(&[BROKEN_ADD_FN]));
    let workflow = ImproveWorkflow::new(services(model), files, PipelineLimits::default()).unwrap();

    let request = ImproveRequest::new("calc.py", "fix add").with_max_retries(max_retries);
    let state = assert_ok!(workflow.run(request, None).await);

    assert_eq!(state.validation_passed, Some(false));
    assert_eq!(state.retry_count, max_retries);
    assert_eq!(state.code_attempts, max_retries + 1);
    assert!(state.last_error.as_deref().unwrap().contains("line 1"));
}

#[tokio::test]
async fn test_selection_improvement_with_auto_write() {
    let original = "import math\n\ndef add(a, b):\n    return a - b\n\nprint(add(1, 2))\n";
    let (dir, files) = workspace_with("calc.py", original);
    let model = Arc::new(ScriptedModel::with_code(&[ADD_FN]));
    let workflow = ImproveWorkflow::new(services(model), files, PipelineLimits::default()).unwrap();

    let request = ImproveRequest::new("calc.py", "fix add")
        .with_selection(LineRange::new(3, 4))
        .with_auto_write(true);
    let state = workflow.run(request, None).await.unwrap();

    let expected = "import math\n\ndef add(a, b):\n    return a + b\n\nprint(add(1, 2))\n";
    assert!(state.written);
    assert_eq!(state.proposed_full_content.as_deref(), Some(expected));
    assert_eq!(std::fs::read_to_string(dir.path().join("calc.py")).unwrap(), expected);

    let backup = state.backup_path.expect("backup recorded");
    assert_eq!(std::fs::read_to_string(dir.path().join(backup)).unwrap(), original);
}

#[tokio::test]
async fn test_fallback_model_reported() {
    let model = Arc::new(ScriptedModel::default().failing_on("primary"));
    let chain = ModelChain::new(model.clone(), "primary", "fallback");

    let completion = assert_ok!(chain.generate(&[Message::user("hello")]).await);
    assert_eq!(completion.model, "fallback");
    assert_eq!(model.attempts("primary"), 1);
    assert_eq!(model.attempts("fallback"), 1);
}

#[tokio::test]
async fn test_both_models_failing_surfaces_last_error() {
    let model = Arc::new(ScriptedModel::default().failing_on("primary").failing_on("fallback"));
    let chain = ModelChain::new(model, "primary", "fallback");

    let err = assert_err!(chain.generate(&[Message::user("hello")]).await);
    assert_eq!(err.to_string(), "model 'fallback' not found");
}

#[tokio::test]
async fn test_agent_stops_at_iteration_limit() {
    let call = "<tool_call>{\"name\": \"list_files\", \"arguments\": {\"path\": \".\"}}</tool_call>";
    let (_dir, files) = workspace_with("calc.py", "x = 1\n");

    for k in [1usize, 4] {
        let model = Arc::new(ScriptedModel::with_code(&[]));
        model.last_coder.lock().push_str(call);
        let chain = ModelChain::new(model.clone(), "primary", "fallback");
        let config = AgentConfig {
            max_iterations: k,
            tool_mode: Some(ToolMode::EmbeddedTag),
            ..Default::default()
        };
        let request = AgentRequest::new("list everything").with_system_prompt(CODER_SYSTEM);
        let outcome = AgentLoop::new(chain, ToolExecutor::new(files.clone()), config)
            .run(request)
            .await
            .unwrap();

        assert!(outcome.hit_iteration_limit);
        assert_eq!(outcome.iterations, k);
        assert_eq!(model.attempts("primary"), k);
        assert!(outcome.tool_results.iter().all(|r| r.success));
    }
}

#[tokio::test]
async fn test_streaming_generation_event_order() {
    let model = Arc::new(ScriptedModel::with_code(&[ADD_FN]));
    let workflow = CodeGenWorkflow::new(services(model), PipelineLimits::default()).unwrap();

    let events: Vec<StreamEvent> = workflow
        .run_streaming("write a function that adds two numbers", Some("s-1".into()))
        .collect()
        .await;

    let tags: Vec<EventTag> = events.iter().map(|e| e.tag).collect();
    let last_of = |tag: EventTag| tags.iter().rposition(|t| *t == tag).unwrap();
    let first_of = |tag: EventTag| tags.iter().position(|t| *t == tag).unwrap();

    assert!(last_of(EventTag::Plan) < first_of(EventTag::Tests));
    assert!(last_of(EventTag::Tests) < first_of(EventTag::Code));
    assert!(last_of(EventTag::Code) < first_of(EventTag::Validation));
    assert_eq!(tags.iter().filter(|t| t.is_terminal()).count(), 1);

    let done = events.last().unwrap();
    assert_eq!(done.tag, EventTag::Done);
    assert_eq!(done.data.as_ref().unwrap()["validation_passed"], true);
}
