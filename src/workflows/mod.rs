//! Concrete workflows built on the pipeline executor
//!
//! - `codegen`: intent → plan → retrieve → tests → code → validate
//! - `improve`: analyze → retrieve → plan → code → validate → {retry | write | error}
//! - `worker`: background queue draining improvement tasks one at a time

pub mod codegen;
pub mod improve;
pub mod prompts;
pub mod selection;
pub mod worker;

use anyhow::Result;
use std::sync::Arc;

use crate::llm::reasoning::{strip_thinking, ReasoningDecoder, Segment};
use crate::llm::{Message, ModelChain, ModelPort};
use crate::pipeline::{EventSink, EventTag, PipelineState, StreamEvent};
use crate::retrieval::RetrievalPort;
use crate::router::ModelSelector;
use crate::sandbox::CodeValidator;
use futures_util::StreamExt;

pub use codegen::CodeGenWorkflow;
pub use improve::{ImproveRequest, ImproveWorkflow};
pub use worker::{ImprovementWorker, TaskStatus};

/// Generation knobs shared by every node
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub retrieval_limit: usize,
    pub retrieval_min_score: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            retrieval_limit: 5,
            retrieval_min_score: 0.25,
        }
    }
}

/// Collaborators injected into workflow nodes
#[derive(Clone)]
pub struct Services {
    pub model: Arc<dyn ModelPort>,
    pub selector: Arc<dyn ModelSelector>,
    pub retrieval: Option<Arc<dyn RetrievalPort>>,
    pub validator: Arc<dyn CodeValidator>,
    pub settings: GenerationSettings,
}

impl Services {
    pub fn new(
        model: Arc<dyn ModelPort>,
        selector: Arc<dyn ModelSelector>,
        validator: Arc<dyn CodeValidator>,
    ) -> Self {
        Self {
            model,
            selector,
            retrieval: None,
            validator,
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn RetrievalPort>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn retrieval(&self) -> Option<&dyn RetrievalPort> {
        self.retrieval.as_deref()
    }

    /// `[primary, fallback]` chain for this state, selecting models if none are set yet
    pub fn chain_for(&self, state: &mut PipelineState) -> ModelChain {
        if state.primary_model.is_none() {
            let choice = self.selector.select(state.query_text());
            state.model_tier = Some(choice.tier);
            state.primary_model = Some(choice.primary);
            state.fallback_model = Some(choice.fallback);
        }
        ModelChain::new(
            Arc::clone(&self.model),
            state.primary_model.as_deref().unwrap_or_default(),
            state.fallback_model.as_deref().unwrap_or_default(),
        )
        .with_temperature(self.settings.temperature)
    }
}

/// Visible output of one generation
pub(crate) struct Generated {
    pub content: String,
    pub model: String,
}

/// Run one generation, streaming content under `tag` when someone is listening.
///
/// Thinking segments go out as `thinking` events and never reach the stored text.
pub(crate) async fn generate_into(
    chain: &ModelChain,
    messages: &[Message],
    sink: &EventSink,
    tag: EventTag,
    node: &str,
) -> Result<Generated> {
    if !sink.is_streaming() {
        let completion = chain.generate(messages).await?;
        return Ok(Generated {
            content: strip_thinking(&completion.content),
            model: completion.model,
        });
    }

    let (model, mut stream) = chain.generate_stream(messages).await?;
    let mut decoder = ReasoningDecoder::new();
    let mut content = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for segment in decoder.feed(&chunk) {
            emit_segment(sink, segment, tag, node, &mut content).await?;
        }
    }
    for segment in decoder.finish() {
        emit_segment(sink, segment, tag, node, &mut content).await?;
    }

    Ok(Generated { content, model })
}

async fn emit_segment(
    sink: &EventSink,
    segment: Segment,
    tag: EventTag,
    node: &str,
    content: &mut String,
) -> Result<()> {
    match segment {
        Segment::Thinking(text) => {
            sink.emit(StreamEvent::new(EventTag::Thinking, text).from_node(node)).await?;
        }
        Segment::Content(text) => {
            content.push_str(&text);
            sink.emit(StreamEvent::new(tag, text).from_node(node)).await?;
        }
    }
    Ok(())
}

/// Pull the code out of a model answer.
///
/// Returns the first fenced block when there is one, otherwise the trimmed
/// text. Non-empty results always end with a newline.
pub fn extract_code(text: &str) -> String {
    let mut lines = text.lines();
    let mut block: Vec<&str> = Vec::new();
    let mut in_block = false;

    for line in lines.by_ref() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            if in_block {
                return finish_block(&block);
            }
            in_block = true;
            continue;
        }
        if in_block {
            block.push(line);
        }
    }

    if in_block {
        // unterminated fence: keep what we have
        return finish_block(&block);
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("{}\n", trimmed)
}

fn finish_block(lines: &[&str]) -> String {
    let mut code = lines.join("\n");
    code.push('\n');
    code
}

/// Truncate to at most `max_chars`, marking the cut
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}\n... (truncated)", cut)
}
