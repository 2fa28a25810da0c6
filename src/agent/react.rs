//! ReAct agent loop
//!
//! Alternates model turns with tool execution over one growing message list.
//! Two modes, chosen from the backend's capability unless pinned:
//! - `Native`: the backend returns structured tool calls next to its text
//! - `EmbeddedTag`: calls are written inline as `<tool_call>` blocks and
//!   stripped from the visible answer
//!
//! A turn without tool calls ends the loop. Tool failures are fed back as
//! observations; only `max_iterations` stops a model that keeps calling tools,
//! and that stop returns the partial answer instead of an error.

use anyhow::Result;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::history::{trim_history, TokenCounter};
use super::tool_parse::{embedded_tool_instructions, extract_tool_calls, ToolCallScanner};
use super::tools::{ProposedEdit, ToolExecutor, ToolResult};
use crate::llm::reasoning::strip_thinking;
use crate::llm::{Message, ModelChain, ReasoningDecoder, Role, Segment, ToolCall, ToolTurnChunk};
use crate::pipeline::{EventSink, EventStream, EventTag, StreamEvent};
use crate::retrieval::{project_map_or_empty, retrieve_context, RetrievalPort};
use crate::workflows::truncate_chars;

const NODE: &str = "agent";
const PROJECT_MAP_CHARS: usize = 1_500;

pub const DEFAULT_AGENT_SYSTEM: &str = "You are a coding assistant working inside the user's project. \
Use the tools to inspect files before changing them. Keep answers short and concrete. \
When you propose a file change, write the complete new file content.";

/// How tool calls travel between the backend and the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    Native,
    EmbeddedTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_iterations: usize,
    /// Token budget for the history sent on each turn
    pub history_tokens: usize,
    pub retrieval_limit: usize,
    pub retrieval_min_score: f32,
    pub include_project_map: bool,
    /// None picks the mode from the backend
    pub tool_mode: Option<ToolMode>,
    pub channel_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            history_tokens: 6_000,
            retrieval_limit: 5,
            retrieval_min_score: 0.25,
            include_project_map: true,
            tool_mode: None,
            channel_capacity: 64,
        }
    }
}

/// One top-level user turn
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub message: String,
    /// Earlier conversation; system messages in here are ignored
    pub history: Vec<Message>,
    pub system_prompt: Option<String>,
}

impl AgentRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Result of a finished loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub answer: String,
    /// Full conversation including the system prompt
    pub messages: Vec<Message>,
    pub proposed_edits: Vec<ProposedEdit>,
    pub tool_results: Vec<ToolResult>,
    pub iterations: usize,
    pub hit_iteration_limit: bool,
    pub model: Option<String>,
}

/// Output of one model turn
struct Turn {
    /// Text shown to the user
    visible: String,
    /// Text stored in history
    raw: String,
    calls: Vec<ToolCall>,
    model: String,
}

#[derive(Clone)]
pub struct AgentLoop {
    chain: ModelChain,
    tools: ToolExecutor,
    retrieval: Option<Arc<dyn RetrievalPort>>,
    config: AgentConfig,
    counter: TokenCounter,
}

impl AgentLoop {
    pub fn new(chain: ModelChain, tools: ToolExecutor, config: AgentConfig) -> Self {
        Self {
            chain,
            tools,
            retrieval: None,
            config,
            counter: TokenCounter::new(),
        }
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn RetrievalPort>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn mode(&self) -> ToolMode {
        self.config.tool_mode.unwrap_or(if self.chain.supports_tools() {
            ToolMode::Native
        } else {
            ToolMode::EmbeddedTag
        })
    }

    pub async fn run(&self, request: AgentRequest) -> Result<AgentOutcome> {
        self.run_with_sink(request, &EventSink::disabled()).await
    }

    /// Streaming run. Events arrive as `content`* then, per tool call,
    /// `tool_call`, an optional `proposed_edit` and `tool_result`, ending in
    /// `done` (the serialized outcome) or `error`. Dropping the stream cancels
    /// the run.
    pub fn run_streaming(&self, request: AgentRequest) -> EventStream {
        let (sink, stream) = EventSink::channel(self.config.channel_capacity);
        let agent = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                result = agent.run_with_sink(request, &sink) => {
                    let terminal = match result {
                        Ok(outcome) => StreamEvent::done(serde_json::to_value(&outcome).unwrap_or_default()),
                        Err(e) => StreamEvent::error(format!("{:#}", e)),
                    };
                    if sink.emit(terminal).await.is_err() {
                        debug!("Consumer gone before terminal event");
                    }
                }
                _ = sink.closed() => {
                    info!("Agent stream consumer dropped, run cancelled");
                }
            }
        });

        stream
    }

    pub async fn run_with_sink(&self, request: AgentRequest, sink: &EventSink) -> Result<AgentOutcome> {
        let mode = self.mode();
        info!("Agent run: mode={:?}, max_iterations={}", mode, self.config.max_iterations);

        let mut system = request
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_AGENT_SYSTEM.to_string());
        if mode == ToolMode::EmbeddedTag {
            system.push_str("\n\n");
            system.push_str(&embedded_tool_instructions(&self.tools.describe()));
        }

        let mut messages = vec![Message::system(system)];
        messages.extend(request.history.iter().filter(|m| m.role != Role::System).cloned());
        messages.push(Message::user(self.user_content(&request.message).await));

        let mut tool_results: Vec<ToolResult> = Vec::new();
        let mut proposed_edits: Vec<ProposedEdit> = Vec::new();
        let mut partial = String::new();
        let mut model: Option<String> = None;

        for iteration in 1..=self.config.max_iterations {
            let window = trim_history(&messages, self.config.history_tokens, &self.counter);
            let turn = match mode {
                ToolMode::Native => self.native_turn(&window, sink).await?,
                ToolMode::EmbeddedTag => self.embedded_turn(&window, sink).await?,
            };
            model = Some(turn.model.clone());

            if turn.calls.is_empty() {
                let answer = turn.visible.trim().to_string();
                messages.push(Message::assistant(turn.raw));
                info!("Agent finished after {} iteration(s)", iteration);
                return Ok(AgentOutcome {
                    answer,
                    messages,
                    proposed_edits,
                    tool_results,
                    iterations: iteration,
                    hit_iteration_limit: false,
                    model,
                });
            }

            if !turn.visible.trim().is_empty() {
                partial = turn.visible.trim().to_string();
            }
            messages.push(match mode {
                ToolMode::Native => Message::assistant_with_calls(turn.raw, turn.calls.clone()),
                ToolMode::EmbeddedTag => Message::assistant(turn.raw),
            });

            debug!("Iteration {}: {} tool call(s)", iteration, turn.calls.len());
            for call in &turn.calls {
                let result = self.dispatch(call, sink).await?;
                let observation = result.observation();
                messages.push(match mode {
                    ToolMode::Native => Message::tool(observation, &call.id),
                    ToolMode::EmbeddedTag => {
                        Message::user(format!("Observation ({}):\n{}", call.name, observation))
                    }
                });
                if let Some(edit) = &result.proposed_edit {
                    proposed_edits.push(edit.clone());
                }
                tool_results.push(result);
            }
        }

        warn!(
            "Agent hit the iteration limit ({}), returning partial answer",
            self.config.max_iterations
        );
        Ok(AgentOutcome {
            answer: partial,
            messages,
            proposed_edits,
            tool_results,
            iterations: self.config.max_iterations,
            hit_iteration_limit: true,
            model,
        })
    }

    /// User message, prefixed with retrieved code and the project map when available
    async fn user_content(&self, message: &str) -> String {
        let retrieval = self.retrieval.as_deref();
        let context = retrieve_context(
            retrieval,
            message,
            self.config.retrieval_limit,
            self.config.retrieval_min_score,
        )
        .await;
        let map = if self.config.include_project_map {
            project_map_or_empty(retrieval).await
        } else {
            String::new()
        };

        if context.is_empty() && map.is_empty() {
            return message.to_string();
        }

        let mut out = String::new();
        if !context.is_empty() {
            out.push_str("Relevant code:\n");
            out.push_str(&context);
            out.push_str("\n\n");
        }
        if !map.is_empty() {
            out.push_str("Project structure:\n");
            out.push_str(&truncate_chars(&map, PROJECT_MAP_CHARS));
            out.push_str("\n\n");
        }
        out.push_str("Request:\n");
        out.push_str(message);
        out
    }

    async fn native_turn(&self, messages: &[Message], sink: &EventSink) -> Result<Turn> {
        let schemas = self.tools.schemas();

        if !sink.is_streaming() {
            let turn = self.chain.chat_with_tools(messages, &schemas).await?;
            let visible = strip_thinking(&turn.content);
            return Ok(Turn {
                raw: visible.clone(),
                visible,
                calls: turn.tool_calls,
                model: turn.model,
            });
        }

        let (model, mut stream) = self.chain.chat_with_tools_stream(messages, &schemas).await?;
        let mut decoder = ReasoningDecoder::new();
        let mut visible = String::new();
        let mut calls = Vec::new();

        while let Some(chunk) = stream.next().await {
            match chunk? {
                ToolTurnChunk::Text(text) => {
                    for segment in decoder.feed(&text) {
                        emit_segment(sink, segment, &mut visible).await?;
                    }
                }
                ToolTurnChunk::ToolCalls(batch) => calls.extend(batch),
            }
        }
        for segment in decoder.finish() {
            emit_segment(sink, segment, &mut visible).await?;
        }

        Ok(Turn {
            raw: visible.clone(),
            visible,
            calls,
            model,
        })
    }

    async fn embedded_turn(&self, messages: &[Message], sink: &EventSink) -> Result<Turn> {
        if !sink.is_streaming() {
            let completion = self.chain.generate(messages).await?;
            let raw = strip_thinking(&completion.content);
            let (visible, calls) = extract_tool_calls(&raw);
            return Ok(Turn {
                visible,
                raw,
                calls,
                model: completion.model,
            });
        }

        let (model, mut stream) = self.chain.generate_stream(messages).await?;
        let mut decoder = ReasoningDecoder::new();
        let mut scanner = ToolCallScanner::new();
        let mut raw = String::new();
        let mut visible = String::new();
        let mut calls = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for segment in decoder.feed(&chunk) {
                scan_segment(sink, segment, &mut scanner, &mut raw, &mut visible, &mut calls).await?;
            }
        }
        for segment in decoder.finish() {
            scan_segment(sink, segment, &mut scanner, &mut raw, &mut visible, &mut calls).await?;
        }
        let tail = scanner.finish();
        if !tail.text.is_empty() {
            sink.emit(StreamEvent::new(EventTag::Content, tail.text.clone()).from_node(NODE))
                .await?;
            visible.push_str(&tail.text);
        }
        calls.extend(tail.calls);

        Ok(Turn {
            visible,
            raw,
            calls,
            model,
        })
    }

    /// Execute one call and report it as tool_call, proposed_edit?, tool_result
    async fn dispatch(&self, call: &ToolCall, sink: &EventSink) -> Result<ToolResult> {
        sink.emit(
            StreamEvent::new(EventTag::ToolCall, call.name.clone())
                .from_node(NODE)
                .with_data(json!({"id": call.id, "name": call.name, "arguments": call.arguments})),
        )
        .await?;

        let result = self.tools.execute(call).await;
        if !result.success {
            debug!("Tool {} failed: {:?}", call.name, result.error);
        }

        if let Some(edit) = &result.proposed_edit {
            sink.emit(
                StreamEvent::new(EventTag::ProposedEdit, edit.path.clone())
                    .from_node(NODE)
                    .with_data(serde_json::to_value(edit).unwrap_or_default()),
            )
            .await?;
        }

        sink.emit(
            StreamEvent::new(EventTag::ToolResult, result.observation())
                .from_node(NODE)
                .with_data(json!({
                    "id": result.call_id,
                    "name": result.tool_name,
                    "success": result.success,
                    "duration_ms": result.duration_ms,
                })),
        )
        .await?;

        Ok(result)
    }
}

async fn emit_segment(sink: &EventSink, segment: Segment, visible: &mut String) -> Result<()> {
    match segment {
        Segment::Thinking(text) => {
            sink.emit(StreamEvent::new(EventTag::Thinking, text).from_node(NODE)).await?;
        }
        Segment::Content(text) => {
            visible.push_str(&text);
            sink.emit(StreamEvent::new(EventTag::Content, text).from_node(NODE)).await?;
        }
    }
    Ok(())
}

async fn scan_segment(
    sink: &EventSink,
    segment: Segment,
    scanner: &mut ToolCallScanner,
    raw: &mut String,
    visible: &mut String,
    calls: &mut Vec<ToolCall>,
) -> Result<()> {
    match segment {
        Segment::Thinking(text) => {
            sink.emit(StreamEvent::new(EventTag::Thinking, text).from_node(NODE)).await?;
        }
        Segment::Content(text) => {
            raw.push_str(&text);
            let out = scanner.feed(&text);
            if !out.text.is_empty() {
                visible.push_str(&out.text);
                sink.emit(StreamEvent::new(EventTag::Content, out.text).from_node(NODE)).await?;
            }
            calls.extend(out.calls);
        }
    }
    Ok(())
}
