//! Model backends
//!
//! Everything the orchestration core knows about language models goes through
//! the [`ModelPort`] trait:
//! - `types`: messages, completions, tool calls and schemas
//! - `fallback`: ordered model chain, first model that does not fail wins
//! - `reasoning`: incremental `<think>` / content splitter for streamed output
//! - `ollama`: local Ollama HTTP backend (chat, streaming, native tools, embeddings)

pub mod fallback;
pub mod ollama;
pub mod reasoning;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

pub use fallback::ModelChain;
pub use reasoning::{ReasoningDecoder, Segment};
pub use types::{
    Completion, Message, Role, TextStream, ToolCall, ToolSchema, ToolTurn, ToolTurnChunk,
    ToolTurnStream,
};

/// Errors from model backends
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model chain is empty")]
    NoModels,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("model '{0}' does not support native tool calling")]
    ToolsUnsupported(String),
}

/// Port to a language-model backend.
///
/// Implementations must be safe for concurrent use by independent sessions.
#[async_trait]
pub trait ModelPort: Send + Sync {
    /// Single-shot generation
    async fn generate(&self, messages: &[Message], model: &str, temperature: f32) -> Result<Completion>;

    /// Streaming generation. Dropping the returned stream cancels the underlying request.
    async fn generate_stream(
        &self,
        messages: &[Message],
        model: &str,
        temperature: f32,
    ) -> Result<TextStream>;

    /// Whether `model` can return structured tool calls
    fn supports_tools(&self, _model: &str) -> bool {
        false
    }

    /// Native tool-calling turn
    async fn chat_with_tools(
        &self,
        _messages: &[Message],
        _tools: &[ToolSchema],
        model: &str,
        _temperature: f32,
    ) -> Result<ToolTurn> {
        Err(ModelError::ToolsUnsupported(model.to_string()).into())
    }

    /// Streaming native tool-calling turn.
    ///
    /// The default replays a non-streaming turn as two chunks.
    async fn chat_with_tools_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        model: &str,
        temperature: f32,
    ) -> Result<ToolTurnStream> {
        let turn = self.chat_with_tools(messages, tools, model, temperature).await?;
        let mut chunks = Vec::new();
        if !turn.content.is_empty() {
            chunks.push(Ok(ToolTurnChunk::Text(turn.content)));
        }
        if !turn.tool_calls.is_empty() {
            chunks.push(Ok(ToolTurnChunk::ToolCalls(turn.tool_calls)));
        }
        Ok(stream::iter(chunks).boxed())
    }
}
