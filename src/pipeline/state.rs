//! Pipeline state
//!
//! One record per session, owned by a single in-flight run. Nodes read the
//! fields they need and overwrite the ones they produce; nothing is removed.

use serde::{Deserialize, Serialize};

use crate::router::{Intent, ModelTier};
use crate::sandbox::ValidationOutcome;

/// 1-based inclusive line range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Parse `"10-20"` or a single line `"7"`
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (start, end) = match text.split_once('-') {
            Some((a, b)) => (a.trim().parse().ok()?, b.trim().parse().ok()?),
            None => {
                let line = text.parse().ok()?;
                (line, line)
            }
        };
        if start == 0 || end < start {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl std::fmt::Display for LineRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Accumulated state of one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineState {
    // request
    pub task: String,
    pub issue: Option<String>,
    pub target_path: Option<String>,
    pub related_paths: Vec<String>,
    pub selection: Option<LineRange>,
    pub auto_write: bool,
    pub max_retries: u32,

    // routing
    pub intent: Option<Intent>,
    pub model_tier: Option<ModelTier>,
    pub primary_model: Option<String>,
    pub fallback_model: Option<String>,
    /// Model that produced the most recent generation
    pub model_used: Option<String>,
    /// Canned or final textual answer
    pub response: Option<String>,

    // context
    pub retrieved_context: Option<String>,
    pub project_structure: Option<String>,
    pub related_context: Option<String>,

    // generation
    pub plan: Option<String>,
    pub tests: Option<String>,
    pub code: Option<String>,
    /// Code under improvement (the selected range when a selection is active)
    pub original_code: Option<String>,
    /// Whole-file snapshot used to splice a selection back in
    pub full_file: Option<String>,
    pub code_attempts: u32,

    // validation and retry
    pub validation: Option<ValidationOutcome>,
    pub validation_passed: Option<bool>,
    pub validation_output: Option<String>,
    pub retry_count: u32,
    pub error_context: Option<String>,
    pub last_error: Option<String>,

    // output
    pub proposed_full_content: Option<String>,
    pub written: bool,
    pub backup_path: Option<String>,

    /// Most recently completed node
    pub current_step: Option<String>,
    /// Every completed node, in order
    pub trail: Vec<String>,
}

macro_rules! take_some {
    ($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
        $(
            if $other.$field.is_some() {
                $self.$field = $other.$field.clone();
            }
        )+
    };
}

impl PipelineState {
    pub fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            ..Default::default()
        }
    }

    /// Overlay a new run's input on top of a stored checkpoint.
    ///
    /// Request fields always come from the new input; any other field set in
    /// the input wins over the checkpoint. Validation and write outcomes of
    /// the earlier run are cleared.
    pub fn merge_from(&mut self, input: &PipelineState) {
        if !input.task.is_empty() {
            self.task = input.task.clone();
        }
        if !input.related_paths.is_empty() {
            self.related_paths = input.related_paths.clone();
        }
        self.selection = input.selection;
        self.auto_write = input.auto_write;
        self.max_retries = input.max_retries;

        // outcomes of the previous run are not results of this one
        self.validation = None;
        self.validation_passed = None;
        self.validation_output = None;
        self.last_error = None;
        self.written = false;
        self.backup_path = None;

        take_some!(
            self, input,
            issue, target_path, intent, model_tier, primary_model, fallback_model, model_used,
            response, retrieved_context, project_structure, related_context, plan, tests, code,
            original_code, full_file, validation, validation_passed, validation_output,
            error_context, last_error, proposed_full_content, backup_path,
        );
    }

    /// Record completion of a node
    pub fn complete_step(&mut self, node: &str) {
        self.current_step = Some(node.to_string());
        self.trail.push(node.to_string());
    }

    /// How many times a node has run in this session
    pub fn runs_of(&self, node: &str) -> usize {
        self.trail.iter().filter(|n| n.as_str() == node).count()
    }

    /// Query used for retrieval: the issue when improving, otherwise the task
    pub fn query_text(&self) -> &str {
        self.issue.as_deref().filter(|i| !i.trim().is_empty()).unwrap_or(&self.task)
    }

    pub fn succeeded(&self) -> bool {
        self.validation_passed == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_range_parse() {
        assert_eq!(LineRange::parse("10-20"), Some(LineRange::new(10, 20)));
        assert_eq!(LineRange::parse(" 7 "), Some(LineRange::new(7, 7)));
        assert_eq!(LineRange::parse("0-3"), None);
        assert_eq!(LineRange::parse("9-3"), None);
        assert_eq!(LineRange::parse("a-b"), None);
        assert_eq!(LineRange::new(3, 5).len(), 3);
    }

    #[test]
    fn test_merge_overlays_input() {
        let mut checkpoint = PipelineState::new("old task");
        checkpoint.plan = Some("old plan".into());
        checkpoint.code = Some("old code".into());
        checkpoint.retry_count = 2;

        let mut input = PipelineState::new("new task");
        input.plan = Some("new plan".into());
        input.max_retries = 3;

        checkpoint.merge_from(&input);
        assert_eq!(checkpoint.task, "new task");
        assert_eq!(checkpoint.plan.as_deref(), Some("new plan"));
        assert_eq!(checkpoint.code.as_deref(), Some("old code"));
        assert_eq!(checkpoint.max_retries, 3);
        assert_eq!(checkpoint.retry_count, 2);
    }

    #[test]
    fn test_merge_clears_previous_outcome() {
        let mut checkpoint = PipelineState::new("task");
        checkpoint.validation_passed = Some(true);
        checkpoint.validation_output = Some("1 check(s) passed".into());
        checkpoint.last_error = Some("old failure".into());
        checkpoint.written = true;
        checkpoint.backup_path = Some("a.py.bak".into());

        checkpoint.merge_from(&PipelineState::new("task again"));
        assert!(checkpoint.validation_passed.is_none());
        assert!(checkpoint.validation_output.is_none());
        assert!(checkpoint.last_error.is_none());
        assert!(!checkpoint.written);
        assert!(checkpoint.backup_path.is_none());
        assert!(!checkpoint.succeeded());
    }

    #[test]
    fn test_trail_and_current_step() {
        let mut state = PipelineState::default();
        state.complete_step("code");
        state.complete_step("validate");
        state.complete_step("code");
        assert_eq!(state.current_step.as_deref(), Some("code"));
        assert_eq!(state.runs_of("code"), 2);
    }

    #[test]
    fn test_serde_defaults() {
        let state: PipelineState = serde_json::from_str(r#"{"task": "x"}"#).unwrap();
        assert_eq!(state.task, "x");
        assert!(state.validation_passed.is_none());
    }
}
