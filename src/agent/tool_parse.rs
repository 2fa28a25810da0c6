//! Embedded tool-call scanner
//!
//! Backends without native tool calling are asked to write calls inline:
//!
//! ```text
//! <tool_call>{"name": "read_file", "arguments": {"path": "src/app.py"}}</tool_call>
//! ```
//!
//! The scanner works on arbitrary chunk boundaries, so the same code handles a
//! live token stream and a complete response. Text outside blocks is visible;
//! blocks never are. Malformed blocks are dropped with a warning.

use serde_json::Value;
use tracing::warn;

use crate::llm::reasoning::partial_marker_suffix;
use crate::llm::ToolCall;

pub const TOOL_OPEN: &str = "<tool_call>";
pub const TOOL_CLOSE: &str = "</tool_call>";

/// Visible text and completed calls produced by one `feed`
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanOutput {
    pub text: String,
    pub calls: Vec<ToolCall>,
}

impl ScanOutput {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.calls.is_empty()
    }
}

/// Incremental `<tool_call>` block scanner
#[derive(Debug, Default)]
pub struct ToolCallScanner {
    inside: bool,
    pending: String,
    malformed: usize,
}

impl ToolCallScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks skipped so far because they did not parse
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub fn feed(&mut self, chunk: &str) -> ScanOutput {
        self.pending.push_str(chunk);
        let mut out = ScanOutput::default();

        loop {
            if self.inside {
                let Some(idx) = self.pending.find(TOOL_CLOSE) else {
                    break;
                };
                let body: String = self.pending[..idx].to_string();
                self.pending.drain(..idx + TOOL_CLOSE.len());
                self.inside = false;
                self.accept(&body, &mut out);
                continue;
            }

            if let Some(idx) = self.pending.find(TOOL_OPEN) {
                out.text.push_str(&self.pending[..idx]);
                self.pending.drain(..idx + TOOL_OPEN.len());
                self.inside = true;
                continue;
            }

            let keep = partial_marker_suffix(&self.pending, TOOL_OPEN);
            let emit = self.pending.len() - keep;
            out.text.extend(self.pending.drain(..emit));
            break;
        }

        out
    }

    /// Flush at end of input. An unterminated block is kept only if it parses.
    pub fn finish(&mut self) -> ScanOutput {
        let mut out = ScanOutput::default();
        let rest = std::mem::take(&mut self.pending);
        if self.inside {
            self.inside = false;
            self.accept(&rest, &mut out);
        } else {
            out.text = rest;
        }
        out
    }

    fn accept(&mut self, body: &str, out: &mut ScanOutput) {
        match parse_block(body) {
            Some(call) => out.calls.push(call),
            None => {
                self.malformed += 1;
                warn!("Skipping malformed tool call block: {}", body.chars().take(120).collect::<String>());
            }
        }
    }
}

/// Parse the JSON body of one block
fn parse_block(body: &str) -> Option<ToolCall> {
    let body = body.trim();
    let body = body
        .strip_prefix("```json")
        .or_else(|| body.strip_prefix("```"))
        .map(|b| b.trim_end().trim_end_matches("```").trim())
        .unwrap_or(body);

    let value: Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;
    let name = object.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }

    let arguments = ["arguments", "parameters", "input"]
        .iter()
        .find_map(|key| object.get(*key))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    let arguments = match arguments {
        Value::String(s) => serde_json::from_str(&s).ok()?,
        other => other,
    };
    if !arguments.is_object() {
        return None;
    }

    Some(ToolCall::new(name, arguments))
}

/// Split a complete response into visible text and tool calls
pub fn extract_tool_calls(text: &str) -> (String, Vec<ToolCall>) {
    let mut scanner = ToolCallScanner::new();
    let mut first = scanner.feed(text);
    let last = scanner.finish();
    first.text.push_str(&last.text);
    first.calls.extend(last.calls);
    (first.text, first.calls)
}

/// Remove every tool-call block, repeating until nothing changes
pub fn strip_tool_calls(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let (stripped, _) = extract_tool_calls(&current);
        if stripped == current {
            return stripped;
        }
        current = stripped;
    }
}

/// Instructions appended to the system prompt in embedded-tag mode
pub fn embedded_tool_instructions(tool_list: &str) -> String {
    format!(
        "You can use these tools:\n{}\n\n\
To call a tool, write exactly one block per call:\n\
{}{{\"name\": \"<tool name>\", \"arguments\": {{...}}}}{}\n\
You may write several blocks in one reply. Tool results come back as Observation messages. \
When you have the answer, reply without any tool_call block.",
        tool_list, TOOL_OPEN, TOOL_CLOSE
    )
}
