//! Ollama backend
//!
//! Local model server used for every generation in the default setup:
//! - `/api/chat` non-streaming and NDJSON streaming
//! - native tool calling through the `tools` request field
//! - `/api/embeddings` for the retrieval index

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{
    Completion, Message, TextStream, ToolCall, ToolSchema, ToolTurn, ToolTurnChunk, ToolTurnStream,
};
use super::{ModelError, ModelPort};
use crate::retrieval::Embedder;

/// Model families known to return structured tool calls
const TOOL_CAPABLE_PREFIXES: &[&str] = &[
    "llama3.1",
    "llama3.2",
    "llama3.3",
    "qwen2.5",
    "qwen3",
    "mistral",
    "mistral-nemo",
    "command-r",
    "hermes3",
    "granite3",
    "firefunction",
];

/// Ollama backend configuration
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub embedding_model: String,
    /// Timeout for non-streaming requests
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Model-name prefixes treated as natively tool-capable
    pub tool_models: Vec<String>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            tool_models: TOOL_CAPABLE_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// `/api/chat` response, also one line of a streamed response
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl ChatResponse {
    fn content(&self) -> &str {
        self.message.as_ref().map(|m| m.content.as_str()).unwrap_or("")
    }

    fn tool_calls(&self) -> Vec<ToolCall> {
        self.message
            .as_ref()
            .map(|m| {
                m.tool_calls
                    .iter()
                    .map(|c| {
                        let arguments = match &c.function.arguments {
                            // some models double-encode the arguments object
                            Value::String(s) => serde_json::from_str(s).unwrap_or(Value::String(s.clone())),
                            other => other.clone(),
                        };
                        ToolCall::new(&c.function.name, arguments)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Ollama HTTP backend
pub struct OllamaBackend {
    config: OllamaConfig,
    client: reqwest::Client,
}

impl OllamaBackend {
    /// Create backend with default config
    pub fn new() -> Result<Self> {
        Self::with_config(OllamaConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Check if Ollama is reachable
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.config.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn chat_body(&self, messages: &[Message], model: &str, temperature: f32, stream: bool) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                let mut wire = serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                });
                if !m.tool_calls.is_empty() {
                    wire["tool_calls"] = m
                        .tool_calls
                        .iter()
                        .map(|c| serde_json::json!({"function": {"name": c.name, "arguments": c.arguments}}))
                        .collect();
                }
                wire
            })
            .collect();

        serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
            "options": { "temperature": temperature }
        })
    }

    async fn post_chat(&self, body: &Value, streaming: bool) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.config.base_url);
        let mut request = self.client.post(&url).json(body);
        if !streaming {
            request = request.timeout(self.config.timeout);
        }

        let response = request
            .send()
            .await
            .map_err(ModelError::Http)
            .context("Failed to send request to Ollama")?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, message }.into());
        }

        Ok(response)
    }

    async fn chat_once(&self, body: &Value) -> Result<ChatResponse> {
        let response = self.post_chat(body, false).await?;
        let mut parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        if let Some(err) = parsed.error.take() {
            return Err(ModelError::InvalidResponse(err).into());
        }
        Ok(parsed)
    }
}

/// Split a streamed body into parsed NDJSON lines
fn ndjson_stream(response: reqwest::Response) -> BoxStream<'static, Result<ChatResponse>> {
    let bytes = response.bytes_stream().boxed();

    stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        |(mut bytes, mut buf, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match parse_line(&line) {
                        None => continue,
                        Some(Ok(chunk)) => {
                            let done = chunk.done;
                            return Some((Ok(chunk), (bytes, buf, done)));
                        }
                        Some(Err(e)) => return Some((Err(e), (bytes, buf, true))),
                    }
                }

                match bytes.next().await {
                    Some(Ok(data)) => buf.extend_from_slice(&data),
                    Some(Err(e)) => {
                        return Some((Err(ModelError::Http(e).into()), (bytes, buf, true)));
                    }
                    None => {
                        let rest = std::mem::take(&mut buf);
                        return parse_line(&rest).map(|item| (item, (bytes, buf, true)));
                    }
                }
            }
        },
    )
    .boxed()
}

fn parse_line(line: &[u8]) -> Option<Result<ChatResponse>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut parsed = match serde_json::from_str::<ChatResponse>(text) {
        Ok(p) => p,
        Err(e) => return Some(Err(ModelError::InvalidResponse(e.to_string()).into())),
    };
    if let Some(err) = parsed.error.take() {
        return Some(Err(ModelError::InvalidResponse(err).into()));
    }
    Some(Ok(parsed))
}

#[async_trait]
impl ModelPort for OllamaBackend {
    async fn generate(&self, messages: &[Message], model: &str, temperature: f32) -> Result<Completion> {
        let body = self.chat_body(messages, model, temperature, false);
        let parsed = self.chat_once(&body).await?;

        debug!("Ollama {} returned {} chars", model, parsed.content().len());
        Ok(Completion {
            content: parsed.content().to_string(),
            model: if parsed.model.is_empty() { model.to_string() } else { parsed.model },
        })
    }

    async fn generate_stream(&self, messages: &[Message], model: &str, temperature: f32) -> Result<TextStream> {
        let body = self.chat_body(messages, model, temperature, true);
        let response = self.post_chat(&body, true).await?;

        let stream = ndjson_stream(response).filter_map(|item| async move {
            match item {
                Ok(chunk) if chunk.content().is_empty() => None,
                Ok(chunk) => Some(Ok(chunk.content().to_string())),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(stream.boxed())
    }

    fn supports_tools(&self, model: &str) -> bool {
        let name = model.to_lowercase();
        self.config.tool_models.iter().any(|p| name.starts_with(p.as_str()))
    }

    async fn chat_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        model: &str,
        temperature: f32,
    ) -> Result<ToolTurn> {
        if !self.supports_tools(model) {
            return Err(ModelError::ToolsUnsupported(model.to_string()).into());
        }

        let mut body = self.chat_body(messages, model, temperature, false);
        body["tools"] = Value::Array(tools.iter().map(|t| t.to_function_format()).collect());

        let parsed = self.chat_once(&body).await?;
        let tool_calls = parsed.tool_calls();
        debug!("Ollama {} returned {} tool call(s)", model, tool_calls.len());

        Ok(ToolTurn {
            content: parsed.content().to_string(),
            tool_calls,
            model: model.to_string(),
        })
    }

    async fn chat_with_tools_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        model: &str,
        temperature: f32,
    ) -> Result<ToolTurnStream> {
        if !self.supports_tools(model) {
            return Err(ModelError::ToolsUnsupported(model.to_string()).into());
        }

        let mut body = self.chat_body(messages, model, temperature, true);
        body["tools"] = Value::Array(tools.iter().map(|t| t.to_function_format()).collect());
        let response = self.post_chat(&body, true).await?;

        let stream = ndjson_stream(response).flat_map(|item| {
            let chunks: Vec<Result<ToolTurnChunk>> = match item {
                Ok(chunk) => {
                    let mut out = Vec::new();
                    if !chunk.content().is_empty() {
                        out.push(Ok(ToolTurnChunk::Text(chunk.content().to_string())));
                    }
                    let calls = chunk.tool_calls();
                    if !calls.is_empty() {
                        out.push(Ok(ToolTurnChunk::ToolCalls(calls)));
                    }
                    out
                }
                Err(e) => vec![Err(e)],
            };
            stream::iter(chunks)
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl Embedder for OllamaBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.config.base_url);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.config.embedding_model,
                "prompt": text
            }))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("Failed to get embedding from Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            warn!("Embedding request failed: {}", status);
            anyhow::bail!("Embedding failed: {}", status);
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        Ok(result.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_capability_by_prefix() {
        let backend = OllamaBackend::with_config(OllamaConfig::default()).unwrap();
        assert!(backend.supports_tools("qwen2.5-coder:7b"));
        assert!(backend.supports_tools("Llama3.1:8b"));
        assert!(!backend.supports_tools("deepseek-r1:7b"));
    }

    #[test]
    fn test_parse_line_variants() {
        assert!(parse_line(b"   \n").is_none());

        let chunk = parse_line(br#"{"model":"m","message":{"role":"assistant","content":"hi"},"done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.content(), "hi");
        assert!(!chunk.done);

        let err = parse_line(br#"{"error":"model 'x' not found"}"#).unwrap();
        assert!(err.is_err());
    }

    #[test]
    fn test_tool_calls_decoded() {
        let raw = r#"{"model":"qwen2.5","done":true,"message":{"role":"assistant","content":"",
            "tool_calls":[{"function":{"name":"read_file","arguments":{"path":"a.py"}}},
                          {"function":{"name":"list_files","arguments":"{\"path\":\".\"}"}}]}}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let calls = parsed.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], "a.py");
        assert_eq!(calls[1].arguments["path"], ".");
    }

    #[test]
    fn test_chat_body_shape() {
        let backend = OllamaBackend::with_config(OllamaConfig::default()).unwrap();
        let body = backend.chat_body(&[Message::system("s"), Message::user("u")], "m", 0.3, true);
        assert_eq!(body["model"], "m");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][1]["role"], "user");
    }
}
