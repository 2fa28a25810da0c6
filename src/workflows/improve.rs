//! Self-improvement workflow
//!
//! ```text
//! analyze ─▶ retrieve ─▶ plan ─▶ code ─▶ validate ─┬─ passed ─────────────▶ write
//!                                  ▲               ├─ retries left ─▶ retry ─┘ (back to code)
//!                                  └───────────────┘
//!                                                  └─ exhausted ─────────▶ error
//! ```
//!
//! With a line selection only `[start, end]` is rewritten, but validation
//! always runs against the whole file with the new code spliced in. The
//! proposed full-file content is produced on every path; the disk is only
//! touched when the request asks for auto-write.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::selection::{extract_lines, match_final_newline, splice_lines};
use super::{extract_code, generate_into, prompts, truncate_chars, Services};
use crate::pipeline::{
    CompiledPipeline, EventSink, EventStream, EventTag, GraphBuilder, LineRange, Node, PipelineLimits,
    PipelineState, StreamEvent,
};
use crate::retrieval::{project_map_or_empty, retrieve_context};
use crate::router::Intent;
use crate::sandbox::ValidationRequest;
use crate::workspace::FilePort;

/// Related files read for context
pub const MAX_RELATED_FILES: usize = 5;
/// Characters kept from each related file
pub const RELATED_FILE_CHARS: usize = 2000;
/// Characters of the project map folded into the retrieval query
const PROJECT_SUMMARY_CHARS: usize = 1500;

/// One improvement request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImproveRequest {
    pub target_path: String,
    pub issue: String,
    #[serde(default)]
    pub related_paths: Vec<String>,
    #[serde(default)]
    pub selection: Option<LineRange>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub auto_write: bool,
}

fn default_max_retries() -> u32 {
    3
}

impl ImproveRequest {
    pub fn new(target_path: &str, issue: &str) -> Self {
        Self {
            target_path: target_path.to_string(),
            issue: issue.to_string(),
            related_paths: Vec::new(),
            selection: None,
            max_retries: default_max_retries(),
            auto_write: false,
        }
    }

    pub fn with_selection(mut self, range: LineRange) -> Self {
        self.selection = Some(range);
        self
    }

    pub fn with_related(mut self, paths: Vec<String>) -> Self {
        self.related_paths = paths;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_auto_write(mut self, auto_write: bool) -> Self {
        self.auto_write = auto_write;
        self
    }

    pub fn into_state(self) -> PipelineState {
        let mut state = PipelineState::new(&format!("Improve {}: {}", self.target_path, self.issue));
        state.issue = Some(self.issue);
        state.target_path = Some(self.target_path);
        state.related_paths = self.related_paths;
        state.selection = self.selection;
        state.max_retries = self.max_retries;
        state.auto_write = self.auto_write;
        state
    }
}

struct Analyze {
    services: Arc<Services>,
    files: Arc<dyn FilePort>,
}

impl Analyze {
    async fn related_context(&self, paths: &[String]) -> String {
        let mut out = String::new();
        for path in paths.iter().take(MAX_RELATED_FILES) {
            match self.files.read(path).await {
                Ok(content) => {
                    out.push_str(&format!(
                        "### {}\n```\n{}\n```\n\n",
                        path,
                        truncate_chars(&content, RELATED_FILE_CHARS)
                    ));
                }
                Err(e) => warn!("Skipping related file {}: {}", path, e),
            }
        }
        if paths.len() > MAX_RELATED_FILES {
            debug!("Ignored {} related file(s) over the limit", paths.len() - MAX_RELATED_FILES);
        }
        out.trim_end().to_string()
    }
}

#[async_trait]
impl Node for Analyze {
    fn name(&self) -> &'static str {
        "analyze"
    }

    async fn run(&self, mut state: PipelineState, _sink: &EventSink) -> Result<PipelineState> {
        let target = state
            .target_path
            .clone()
            .context("improvement needs a target file")?;
        let content = self
            .files
            .read(&target)
            .await
            .with_context(|| format!("failed to read {}", target))?;

        state.original_code = Some(match state.selection {
            Some(range) => extract_lines(&content, range).with_context(|| format!("bad selection for {}", target))?,
            None => content.clone(),
        });
        state.full_file = Some(content);
        state.related_context = Some(self.related_context(&state.related_paths).await);

        let choice = self.services.selector.select(state.query_text());
        state.intent = Some(Intent::Improve);
        state.model_tier = Some(choice.tier);
        state.primary_model = Some(choice.primary);
        state.fallback_model = Some(choice.fallback);

        state.retry_count = 0;
        state.code_attempts = 0;
        state.written = false;

        info!(
            "Analyzing {} ({} lines selected, tier {})",
            target,
            state.selection.map(|r| r.len()).unwrap_or(0),
            choice.tier.as_str()
        );
        Ok(state)
    }
}

struct Retrieve {
    services: Arc<Services>,
}

#[async_trait]
impl Node for Retrieve {
    fn name(&self) -> &'static str {
        "retrieve"
    }

    async fn run(&self, mut state: PipelineState, _sink: &EventSink) -> Result<PipelineState> {
        let map = project_map_or_empty(self.services.retrieval()).await;
        let summary = truncate_chars(&map, PROJECT_SUMMARY_CHARS);

        let query = if summary.is_empty() {
            state.query_text().to_string()
        } else {
            format!("{}\n{}", state.query_text(), summary)
        };

        let settings = &self.services.settings;
        state.retrieved_context = Some(
            retrieve_context(
                self.services.retrieval(),
                &query,
                settings.retrieval_limit,
                settings.retrieval_min_score,
            )
            .await,
        );
        state.project_structure = Some(summary);
        Ok(state)
    }
}

struct Plan {
    services: Arc<Services>,
}

#[async_trait]
impl Node for Plan {
    fn name(&self) -> &'static str {
        "plan"
    }

    async fn run(&self, mut state: PipelineState, sink: &EventSink) -> Result<PipelineState> {
        let chain = self.services.chain_for(&mut state);
        let messages = prompts::improve_plan_messages(&state);
        let generated = generate_into(&chain, &messages, sink, EventTag::Plan, self.name()).await?;

        state.plan = Some(generated.content.trim().to_string());
        state.model_used = Some(generated.model);
        Ok(state)
    }
}

struct Code {
    services: Arc<Services>,
}

#[async_trait]
impl Node for Code {
    fn name(&self) -> &'static str {
        "code"
    }

    async fn run(&self, mut state: PipelineState, sink: &EventSink) -> Result<PipelineState> {
        let chain = self.services.chain_for(&mut state);
        let messages = prompts::improve_code_messages(&state);
        let generated = generate_into(&chain, &messages, sink, EventTag::Code, self.name()).await?;

        state.code_attempts += 1;
        debug!("Code attempt {} from {}", state.code_attempts, generated.model);
        state.code = Some(extract_code(&generated.content));
        state.model_used = Some(generated.model);
        Ok(state)
    }
}

struct Validate {
    services: Arc<Services>,
}

#[async_trait]
impl Node for Validate {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn run(&self, mut state: PipelineState, sink: &EventSink) -> Result<PipelineState> {
        let code = state.code.clone().unwrap_or_default();
        let candidate = match (state.selection, state.full_file.as_deref()) {
            (Some(range), Some(full)) => splice_lines(full, range, &code)?,
            (None, Some(full)) if !full.is_empty() => match_final_newline(&code, full.ends_with('\n')),
            _ => code,
        };

        let mut request = ValidationRequest::new(&candidate);
        if let Some(path) = state.target_path.as_deref() {
            request = request.with_path(path);
        }
        let outcome = self.services.validator.validate(&request).await;
        info!(
            "Validation attempt {}: {} ({} ms)",
            state.code_attempts,
            outcome.kind.as_str(),
            outcome.duration_ms
        );

        sink.emit(
            StreamEvent::new(EventTag::Validation, outcome.diagnostic.clone())
                .from_node(self.name())
                .with_data(serde_json::to_value(&outcome)?),
        )
        .await?;

        state.proposed_full_content = Some(candidate);
        state.validation_passed = Some(outcome.passed);
        state.validation_output = Some(outcome.diagnostic.clone());
        state.last_error = if outcome.passed {
            None
        } else {
            Some(outcome.diagnostic.clone())
        };
        state.validation = Some(outcome);
        Ok(state)
    }
}

fn after_validate(state: &PipelineState) -> &'static str {
    if state.succeeded() {
        "write"
    } else if state.retry_count < state.max_retries {
        "retry"
    } else {
        "error"
    }
}

struct Retry {
    services: Arc<Services>,
}

#[async_trait]
impl Node for Retry {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn run(&self, mut state: PipelineState, _sink: &EventSink) -> Result<PipelineState> {
        state.retry_count += 1;
        let diagnostic = state.validation_output.clone().unwrap_or_default();
        info!("Retry {}/{} after: {}", state.retry_count, state.max_retries, diagnostic.lines().next().unwrap_or(""));

        let settings = &self.services.settings;
        state.error_context = Some(
            retrieve_context(
                self.services.retrieval(),
                &diagnostic,
                settings.retrieval_limit,
                settings.retrieval_min_score,
            )
            .await,
        );
        Ok(state)
    }
}

struct Write {
    files: Arc<dyn FilePort>,
}

#[async_trait]
impl Node for Write {
    fn name(&self) -> &'static str {
        "write"
    }

    async fn run(&self, mut state: PipelineState, sink: &EventSink) -> Result<PipelineState> {
        let target = state.target_path.clone().unwrap_or_default();
        let content = state.proposed_full_content.clone().unwrap_or_default();

        if state.auto_write {
            let outcome = self
                .files
                .write(&target, &content, true)
                .await
                .with_context(|| format!("failed to write {}", target))?;
            state.written = true;
            state.backup_path = outcome.backup_path;
        } else {
            debug!("Auto-write off, proposing edit to {}", target);
        }

        sink.emit(
            StreamEvent::new(EventTag::ProposedEdit, content)
                .from_node(self.name())
                .with_data(serde_json::json!({
                    "path": target,
                    "written": state.written,
                    "backup_path": state.backup_path,
                    "selection": state.selection,
                })),
        )
        .await?;
        Ok(state)
    }
}

struct GiveUp;

#[async_trait]
impl Node for GiveUp {
    fn name(&self) -> &'static str {
        "error"
    }

    async fn run(&self, mut state: PipelineState, _sink: &EventSink) -> Result<PipelineState> {
        let diagnostic = state.validation_output.clone().unwrap_or_default();
        warn!(
            "Giving up on {} after {} retr{}",
            state.target_path.as_deref().unwrap_or("?"),
            state.retry_count,
            if state.retry_count == 1 { "y" } else { "ies" }
        );
        state.last_error = Some(diagnostic);
        Ok(state)
    }
}

/// Node executions of a run that exhausts `max_retries`: analyze, retrieve,
/// plan, code and validate once, then retry, code and validate per retry,
/// then write or error.
pub fn steps_needed(max_retries: u32) -> usize {
    6 + 3 * max_retries as usize
}

/// Improvement pipeline bound to one set of services and a workspace
#[derive(Clone)]
pub struct ImproveWorkflow {
    pipeline: CompiledPipeline,
}

impl ImproveWorkflow {
    pub fn new(services: Services, files: Arc<dyn FilePort>, limits: PipelineLimits) -> Result<Self> {
        let services = Arc::new(services);
        let graph = GraphBuilder::new()
            .add_node(Analyze {
                services: Arc::clone(&services),
                files: Arc::clone(&files),
            })
            .add_node(Retrieve {
                services: Arc::clone(&services),
            })
            .add_node(Plan {
                services: Arc::clone(&services),
            })
            .add_node(Code {
                services: Arc::clone(&services),
            })
            .add_node(Validate {
                services: Arc::clone(&services),
            })
            .add_node(Retry { services })
            .add_node(Write { files })
            .add_node(GiveUp)
            .set_entry("analyze")
            .add_edge("analyze", "retrieve")
            .add_edge("retrieve", "plan")
            .add_edge("plan", "code")
            .add_edge("code", "validate")
            .add_conditional_edges(
                "validate",
                after_validate,
                &[("write", "write"), ("retry", "retry"), ("error", "error")],
            )
            .add_edge("retry", "code")
            .compile()?;

        Ok(Self {
            pipeline: CompiledPipeline::new(graph, limits),
        })
    }

    pub fn pipeline(&self) -> &CompiledPipeline {
        &self.pipeline
    }

    /// Pipeline whose step limit covers every retry `request` allows
    fn pipeline_for(&self, request: &ImproveRequest) -> CompiledPipeline {
        let needed = steps_needed(request.max_retries);
        if needed <= self.pipeline.limits().step_limit {
            return self.pipeline.clone();
        }
        debug!("Raising step limit to {} for {} retries", needed, request.max_retries);
        self.pipeline.with_step_limit(needed)
    }

    pub async fn run(&self, request: ImproveRequest, session_id: Option<&str>) -> Result<PipelineState> {
        self.pipeline_for(&request).run(request.into_state(), session_id).await
    }

    /// Run with a caller-owned sink (progress reporting, custom channels)
    pub async fn run_with_sink(
        &self,
        request: ImproveRequest,
        session_id: Option<&str>,
        sink: &EventSink,
    ) -> Result<PipelineState> {
        self.pipeline_for(&request)
            .run_with_sink(request.into_state(), session_id, sink)
            .await
    }

    pub fn run_streaming(&self, request: ImproveRequest, session_id: Option<String>) -> EventStream {
        self.pipeline_for(&request).run_streaming(request.into_state(), session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, Message, ModelPort, TextStream};
    use crate::retrieval::{RetrievalPort, RetrievedChunk};
    use crate::router::KeywordModelSelector;
    use crate::sandbox::{CodeValidator, Language, ValidationKind, ValidationOutcome};
    use crate::workspace::LocalWorkspace;
    use futures_util::{stream, StreamExt};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    const ORIGINAL: &str = "def first():\n    return 1\n\ndef second():\n    return 2\n";

    /// Plans are canned; code answers are popped in order
    struct ScriptedCoder {
        code: Mutex<VecDeque<String>>,
        code_calls: Mutex<usize>,
    }

    impl ScriptedCoder {
        fn new(answers: &[&str]) -> Self {
            Self {
                code: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
                code_calls: Mutex::new(0),
            }
        }

        fn answer(&self, messages: &[Message]) -> String {
            if messages[0].content == prompts::PLANNER_SYSTEM {
                return "1. change the return value".into();
            }
            *self.code_calls.lock() += 1;
            let mut queue = self.code.lock();
            if queue.len() > 1 {
                queue.pop_front().unwrap_or_default()
            } else {
                queue.front().cloned().unwrap_or_default()
            }
        }
    }

    #[async_trait]
    impl ModelPort for ScriptedCoder {
        async fn generate(&self, messages: &[Message], model: &str, _t: f32) -> Result<Completion> {
            Ok(Completion {
                content: self.answer(messages),
                model: model.to_string(),
            })
        }

        async fn generate_stream(&self, messages: &[Message], _model: &str, _t: f32) -> Result<TextStream> {
            let text = self.answer(messages);
            Ok(stream::iter(vec![Ok(text)]).boxed())
        }
    }

    /// Fails anything containing "BROKEN", records what it saw
    #[derive(Default)]
    struct MarkerValidator {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CodeValidator for MarkerValidator {
        async fn validate(&self, request: &ValidationRequest) -> ValidationOutcome {
            self.seen.lock().push(request.code.clone());
            if request.code.contains("BROKEN") {
                ValidationOutcome::failed(ValidationKind::Syntax, Language::Python, "line 2: invalid syntax", 1)
            } else {
                ValidationOutcome::passed(Language::Python, "", 1)
            }
        }
    }

    struct QueryLog(Mutex<Vec<String>>);

    #[async_trait]
    impl RetrievalPort for QueryLog {
        async fn search(&self, query: &str, _limit: usize, _min_score: f32) -> Result<Vec<RetrievedChunk>> {
            self.0.lock().push(query.to_string());
            Ok(vec![RetrievedChunk {
                content: format!("similar to: {}", query.lines().next().unwrap_or("")),
                metadata: serde_json::json!({"path": "lib/other.py"}),
                score: 0.9,
            }])
        }

        async fn project_map(&self) -> Result<Option<String>> {
            Ok(Some("app.py (2 chunks)".into()))
        }
    }

    struct Fixture {
        dir: TempDir,
        model: Arc<ScriptedCoder>,
        validator: Arc<MarkerValidator>,
        retrieval: Arc<QueryLog>,
        workflow: ImproveWorkflow,
    }

    fn fixture(answers: &[&str]) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.py"), ORIGINAL).unwrap();

        let model = Arc::new(ScriptedCoder::new(answers));
        let validator = Arc::new(MarkerValidator::default());
        let retrieval = Arc::new(QueryLog(Mutex::new(Vec::new())));
        let services = Services::new(
            model.clone(),
            Arc::new(KeywordModelSelector::single("primary", "fallback")),
            validator.clone(),
        )
        .with_retrieval(retrieval.clone());
        let files: Arc<dyn FilePort> = Arc::new(LocalWorkspace::new(dir.path()));
        let workflow = ImproveWorkflow::new(services, files, PipelineLimits::default()).unwrap();

        Fixture {
            dir,
            model,
            validator,
            retrieval,
            workflow,
        }
    }

    #[tokio::test]
    async fn test_selection_is_spliced_before_validation() {
        let fx = fixture(&["def second():\n    return 20\n"]);
        let request = ImproveRequest::new("app.py", "return twenty").with_selection(LineRange::new(4, 5));

        let state = fx.workflow.run(request, None).await.unwrap();

        let expected = "def first():\n    return 1\n\ndef second():\n    return 20\n";
        assert_eq!(state.original_code.as_deref(), Some("def second():\n    return 2\n"));
        assert_eq!(state.proposed_full_content.as_deref(), Some(expected));
        assert_eq!(fx.validator.seen.lock().as_slice(), &[expected.to_string()]);

        // not written without auto-write
        assert!(!state.written);
        let on_disk = std::fs::read_to_string(fx.dir.path().join("app.py")).unwrap();
        assert_eq!(on_disk, ORIGINAL);
        assert_eq!(state.current_step.as_deref(), Some("write"));
    }

    #[tokio::test]
    async fn test_missing_final_newline_is_kept() {
        let fx = fixture(&["def second():\n    return 2\n"]);
        let unterminated = ORIGINAL.trim_end();
        std::fs::write(fx.dir.path().join("app.py"), unterminated).unwrap();

        let request = ImproveRequest::new("app.py", "no change").with_selection(LineRange::new(4, 5));
        let state = fx.workflow.run(request, None).await.unwrap();
        assert_eq!(state.proposed_full_content.as_deref(), Some(unterminated));

        let fx = fixture(&["def first():\n    return 1\n"]);
        std::fs::write(fx.dir.path().join("app.py"), "def first():\n    return 0").unwrap();
        let state = fx.workflow.run(ImproveRequest::new("app.py", "return one"), None).await.unwrap();
        assert_eq!(state.proposed_full_content.as_deref(), Some("def first():\n    return 1"));
    }

    #[tokio::test]
    async fn test_retry_refreshes_error_context() {
        let fx = fixture(&["BROKEN(", "def first():\n    return 1\n"]);
        let request = ImproveRequest::new("app.py", "tidy up").with_max_retries(2);

        let state = fx.workflow.run(request, None).await.unwrap();

        assert_eq!(state.validation_passed, Some(true));
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.code_attempts, 2);
        assert!(state.error_context.as_deref().unwrap().contains("line 2: invalid syntax"));

        let queries = fx.retrieval.0.lock().clone();
        assert!(queries[0].starts_with("tidy up\napp.py"));
        assert_eq!(queries[1], "line 2: invalid syntax");
    }

    #[tokio::test]
    async fn test_exhausted_retries_end_in_error() {
        let fx = fixture(&["BROKEN("]);
        let request = ImproveRequest::new("app.py", "tidy up")
            .with_max_retries(2)
            .with_auto_write(true);

        let state = fx.workflow.run(request, None).await.unwrap();

        assert_eq!(state.current_step.as_deref(), Some("error"));
        assert_eq!(state.retry_count, 2);
        assert_eq!(*fx.model.code_calls.lock(), 3);
        assert_eq!(state.last_error.as_deref(), Some("line 2: invalid syntax"));
        assert_eq!(state.proposed_full_content.as_deref(), Some("BROKEN(\n"));
        assert!(!state.written);
        let on_disk = std::fs::read_to_string(fx.dir.path().join("app.py")).unwrap();
        assert_eq!(on_disk, ORIGINAL);
    }

    #[tokio::test]
    async fn test_large_retry_budget_outlives_default_step_limit() {
        let fx = fixture(&["BROKEN("]);
        let max_retries = 12;
        assert!(steps_needed(max_retries) > PipelineLimits::default().step_limit);
        let request = ImproveRequest::new("app.py", "tidy up").with_max_retries(max_retries);

        let state = fx.workflow.run(request, None).await.unwrap();

        assert_eq!(state.current_step.as_deref(), Some("error"));
        assert_eq!(state.validation_passed, Some(false));
        assert_eq!(state.retry_count, max_retries);
        assert_eq!(*fx.model.code_calls.lock(), max_retries as usize + 1);
        assert_eq!(state.last_error.as_deref(), Some("line 2: invalid syntax"));
        // the configured limit is left alone for later runs
        assert_eq!(fx.workflow.pipeline().limits().step_limit, 32);
    }

    #[test]
    fn test_steps_needed_matches_graph() {
        assert_eq!(steps_needed(0), 6);
        assert_eq!(steps_needed(3), 15);
    }

    #[tokio::test]
    async fn test_auto_write_backs_up() {
        let fx = fixture(&["def first():\n    return 100\n"]);
        let request = ImproveRequest::new("app.py", "bigger").with_auto_write(true);

        let state = fx.workflow.run(request, None).await.unwrap();

        assert!(state.written);
        let backup = state.backup_path.unwrap();
        assert_eq!(std::fs::read_to_string(fx.dir.path().join(backup)).unwrap(), ORIGINAL);
        assert_eq!(
            std::fs::read_to_string(fx.dir.path().join("app.py")).unwrap(),
            "def first():\n    return 100\n"
        );
    }

    #[tokio::test]
    async fn test_missing_target_is_fatal() {
        let fx = fixture(&["x"]);
        let err = fx
            .workflow
            .run(ImproveRequest::new("nope.py", "anything"), None)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("nope.py"));
    }
}
