//! Tool executor
//!
//! Dispatches named tool calls against the injected file, shell and retrieval
//! ports. Execution never fails outright: every problem, including a bad
//! argument payload, becomes an unsuccessful [`ToolResult`] that the agent
//! feeds back to the model as an `Error: ...` observation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::llm::{ToolCall, ToolSchema};
use crate::retrieval::{format_context, RetrievalPort};
use crate::sandbox::ShellPort;
use crate::workspace::FilePort;

/// Characters returned by `read_file` before truncation
pub const MAX_READ_CHARS: usize = 12_000;
/// Characters of command output returned by `run_command`
pub const MAX_COMMAND_OUTPUT_CHARS: usize = 8_000;

/// A file modification staged for caller approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEdit {
    pub path: String,
    pub content: String,
    /// Content before the edit; None for a new file
    pub original: Option<String>,
}

/// Outcome of one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub call_id: String,
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
    pub proposed_edit: Option<ProposedEdit>,
    pub duration_ms: u64,
}

impl ToolResult {
    fn ok(call: &ToolCall, content: String) -> Self {
        Self {
            tool_name: call.name.clone(),
            call_id: call.id.clone(),
            success: true,
            content,
            error: None,
            proposed_edit: None,
            duration_ms: 0,
        }
    }

    fn err(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            tool_name: call.name.clone(),
            call_id: call.id.clone(),
            success: false,
            content: String::new(),
            error: Some(error.into()),
            proposed_edit: None,
            duration_ms: 0,
        }
    }

    fn with_content(mut self, content: String) -> Self {
        self.content = content;
        self
    }

    fn with_proposed_edit(mut self, edit: ProposedEdit) -> Self {
        self.proposed_edit = Some(edit);
        self
    }

    /// Text fed back to the model
    pub fn observation(&self) -> String {
        if self.success {
            return self.content.clone();
        }
        let error = self.error.as_deref().unwrap_or("tool failed");
        if self.content.is_empty() {
            format!("Error: {}", error)
        } else {
            format!("Error: {}\n{}", error, self.content)
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

fn int_arg(args: &Value, key: &str) -> Option<usize> {
    args.get(key).and_then(|v| v.as_u64()).map(|n| n as usize)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}\n... (truncated at {} chars)", cut, max_chars)
}

/// Dispatcher for the agent's tool surface
#[derive(Clone)]
pub struct ToolExecutor {
    files: Arc<dyn FilePort>,
    shell: Option<Arc<dyn ShellPort>>,
    retrieval: Option<Arc<dyn RetrievalPort>>,
    stage_writes: bool,
    retrieval_limit: usize,
    retrieval_min_score: f32,
}

impl ToolExecutor {
    pub fn new(files: Arc<dyn FilePort>) -> Self {
        Self {
            files,
            shell: None,
            retrieval: None,
            stage_writes: true,
            retrieval_limit: 5,
            retrieval_min_score: 0.25,
        }
    }

    pub fn with_shell(mut self, shell: Arc<dyn ShellPort>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn RetrievalPort>, limit: usize, min_score: f32) -> Self {
        self.retrieval = Some(retrieval);
        self.retrieval_limit = limit;
        self.retrieval_min_score = min_score;
        self
    }

    /// Stage writes as proposed edits (default) or write through to disk
    pub fn stage_writes(mut self, stage: bool) -> Self {
        self.stage_writes = stage;
        self
    }

    pub fn is_staging(&self) -> bool {
        self.stage_writes
    }

    /// Schemas of every available tool
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = vec![
            ToolSchema::new("read_file", "Read a file from the workspace, optionally a 1-based line range")
                .with_string_param("path", "Path relative to the workspace root", true)
                .with_int_param("start_line", "First line to return", false)
                .with_int_param("end_line", "Last line to return", false),
            ToolSchema::new(
                "write_file",
                "Replace the full content of a file. The previous version is backed up.",
            )
            .with_string_param("path", "Path relative to the workspace root", true)
            .with_string_param("content", "Complete new file content", true),
            ToolSchema::new("list_files", "List a directory in the workspace")
                .with_string_param("path", "Directory relative to the workspace root (default: root)", false),
        ];
        if self.retrieval.is_some() {
            schemas.push(
                ToolSchema::new("search_retrieve", "Semantic search over the indexed project code")
                    .with_string_param("query", "What to look for", true)
                    .with_int_param("limit", "Maximum number of results", false),
            );
        }
        if self.shell.is_some() {
            schemas.push(
                ToolSchema::new("run_command", "Run a shell command in the workspace (filtered and time-limited)")
                    .with_string_param("command", "Command line to run", true)
                    .with_string_param("cwd", "Working directory relative to the workspace root", false),
            );
        }
        schemas
    }

    /// Tool list for prompts of backends without native tool calling
    pub fn describe(&self) -> String {
        self.schemas()
            .iter()
            .map(|s| format!("- {}: {}", s.signature(), s.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Execute one call. Never fails; problems are reported in the result.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        debug!("Tool call {} {}", call.name, call.arguments);

        let schemas = self.schemas();
        let mut result = match schemas.iter().find(|s| s.name == call.name) {
            None => ToolResult::err(call, format!("unknown tool '{}'", call.name)),
            Some(schema) => match schema.validate(&call.arguments) {
                Err(reason) => ToolResult::err(call, reason),
                Ok(()) => self.dispatch(call).await,
            },
        };
        result.duration_ms = start.elapsed().as_millis() as u64;

        if result.success {
            info!("Tool {} ok ({} ms)", call.name, result.duration_ms);
        } else {
            warn!("Tool {} failed: {}", call.name, result.error.as_deref().unwrap_or(""));
        }
        result
    }

    async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        match call.name.as_str() {
            "read_file" => self.read_file(call).await,
            "write_file" => self.write_file(call).await,
            "list_files" => self.list_files(call).await,
            "search_retrieve" => self.search_retrieve(call).await,
            "run_command" => self.run_command(call).await,
            other => ToolResult::err(call, format!("unknown tool '{}'", other)),
        }
    }

    async fn read_file(&self, call: &ToolCall) -> ToolResult {
        let path = str_arg(&call.arguments, "path").unwrap_or_default();
        let content = match self.files.read(path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(call, e.to_string()),
        };

        let start = int_arg(&call.arguments, "start_line");
        let end = int_arg(&call.arguments, "end_line");
        let text = if start.is_some() || end.is_some() {
            let start = start.unwrap_or(1).max(1);
            let end = end.unwrap_or(usize::MAX);
            if end < start {
                return ToolResult::err(call, format!("end_line {} is before start_line {}", end, start));
            }
            content
                .lines()
                .enumerate()
                .skip(start - 1)
                .take_while(|(i, _)| *i < end)
                .map(|(i, line)| format!("{:>5} | {}", i + 1, line))
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            content
        };

        ToolResult::ok(call, truncate(&text, MAX_READ_CHARS))
    }

    async fn write_file(&self, call: &ToolCall) -> ToolResult {
        let path = str_arg(&call.arguments, "path").unwrap_or_default();
        let content = str_arg(&call.arguments, "content").unwrap_or_default();

        if self.stage_writes {
            if let Err(e) = self.files.resolve(path) {
                return ToolResult::err(call, e.to_string());
            }
            let original = self.files.read(path).await.ok();
            let edit = ProposedEdit {
                path: path.to_string(),
                content: content.to_string(),
                original,
            };
            return ToolResult::ok(
                call,
                format!("Staged edit to {} ({} bytes), waiting for approval", path, content.len()),
            )
            .with_proposed_edit(edit);
        }

        match self.files.write(path, content, true).await {
            Ok(outcome) => {
                let mut message = format!("Wrote {} bytes to {}", outcome.bytes_written, outcome.path);
                if let Some(backup) = outcome.backup_path {
                    message.push_str(&format!(" (backup: {})", backup));
                }
                ToolResult::ok(call, message)
            }
            Err(e) => ToolResult::err(call, e.to_string()),
        }
    }

    async fn list_files(&self, call: &ToolCall) -> ToolResult {
        let path = str_arg(&call.arguments, "path").filter(|p| !p.is_empty()).unwrap_or(".");
        match self.files.list(path).await {
            Ok(entries) if entries.is_empty() => ToolResult::ok(call, "(empty directory)".into()),
            Ok(entries) => {
                let listing = entries
                    .iter()
                    .map(|e| {
                        if e.is_dir {
                            format!("{}/", e.name)
                        } else {
                            format!("{} ({} bytes)", e.name, e.size)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolResult::ok(call, listing)
            }
            Err(e) => ToolResult::err(call, e.to_string()),
        }
    }

    async fn search_retrieve(&self, call: &ToolCall) -> ToolResult {
        let Some(retrieval) = &self.retrieval else {
            return ToolResult::err(call, "retrieval is not configured");
        };
        let query = str_arg(&call.arguments, "query").unwrap_or_default();
        let limit = int_arg(&call.arguments, "limit").unwrap_or(self.retrieval_limit).clamp(1, 20);

        match retrieval.search(query, limit, self.retrieval_min_score).await {
            Ok(chunks) if chunks.is_empty() => ToolResult::ok(call, "No matching code found.".into()),
            Ok(chunks) => ToolResult::ok(call, format_context(&chunks)),
            Err(e) => ToolResult::err(call, format!("search failed: {}", e)),
        }
    }

    async fn run_command(&self, call: &ToolCall) -> ToolResult {
        let Some(shell) = &self.shell else {
            return ToolResult::err(call, "shell access is not configured");
        };
        let command = str_arg(&call.arguments, "command").unwrap_or_default();
        let cwd = str_arg(&call.arguments, "cwd").filter(|c| !c.is_empty()).unwrap_or(".");

        let dir = match self.files.resolve(cwd) {
            Ok(dir) => dir,
            Err(e) => return ToolResult::err(call, e.to_string()),
        };

        let output = match shell.execute(command, &dir).await {
            Ok(output) => output,
            Err(e) => return ToolResult::err(call, format!("{:#}", e)),
        };

        let mut text = match output.exit_code {
            Some(code) => format!("exit code: {}", code),
            None => "exit code: none".to_string(),
        };
        if !output.stdout.trim().is_empty() {
            text.push_str(&format!("\n--- stdout ---\n{}", output.stdout.trim_end()));
        }
        if !output.stderr.trim().is_empty() {
            text.push_str(&format!("\n--- stderr ---\n{}", output.stderr.trim_end()));
        }
        if output.truncated {
            text.push_str("\n(output truncated)");
        }
        let text = truncate(&text, MAX_COMMAND_OUTPUT_CHARS);

        if output.timed_out {
            ToolResult::err(call, "command timed out").with_content(text)
        } else if output.success() {
            ToolResult::ok(call, text)
        } else {
            ToolResult::err(call, "command exited with a non-zero status").with_content(text)
        }
    }
}
