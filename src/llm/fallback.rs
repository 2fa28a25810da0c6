//! Model Fallback Chain
//!
//! Wraps every generation call with an ordered list of model ids:
//! - each model is attempted at most once, in order
//! - the first model whose call does not fail wins, and its id is reported
//! - when every model fails, the last backend error is returned unmodified
//!
//! Streaming calls peek the first chunk: a stream that errors before producing
//! anything counts as a failed call and falls through to the next model. Once a
//! chunk has been handed to the consumer the chain is committed to that model.

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::types::{Completion, Message, TextStream, ToolSchema, ToolTurn, ToolTurnStream};
use super::{ModelError, ModelPort};

/// Coarse classification of a backend failure, used for logging fallback hops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network or timeout, the next model may well succeed
    Transient,
    /// Backend asked us to slow down
    RateLimited,
    /// Model not pulled / backend down
    Unavailable,
    /// Request rejected (bad input, unsupported capability)
    Rejected,
    Unknown,
}

impl FailureClass {
    /// Classify an error from its message
    pub fn from_error(error: &str) -> Self {
        let lower = error.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
            Self::RateLimited
        } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("connection") {
            Self::Transient
        } else if lower.contains("not found") || lower.contains("unavailable") || lower.contains("503") {
            Self::Unavailable
        } else if lower.contains("invalid") || lower.contains("unsupported") || lower.contains("does not support") || lower.contains("400") {
            Self::Rejected
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
            Self::Unknown => "unknown",
        }
    }
}

/// Ordered model chain bound to one backend
#[derive(Clone)]
pub struct ModelChain {
    port: Arc<dyn ModelPort>,
    models: Vec<String>,
    temperature: f32,
}

impl std::fmt::Debug for ModelChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelChain")
            .field("models", &self.models)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl ModelChain {
    /// Two-element chain `[primary, fallback]`
    pub fn new(port: Arc<dyn ModelPort>, primary: &str, fallback: &str) -> Self {
        Self::from_models(port, vec![primary.to_string(), fallback.to_string()])
    }

    /// Chain over an arbitrary ordered list. Blank and duplicate ids are dropped.
    pub fn from_models(port: Arc<dyn ModelPort>, models: Vec<String>) -> Self {
        let mut deduped: Vec<String> = Vec::with_capacity(models.len());
        for model in models {
            let model = model.trim().to_string();
            if !model.is_empty() && !deduped.contains(&model) {
                deduped.push(model);
            }
        }
        Self {
            port,
            models: deduped,
            temperature: 0.2,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn primary(&self) -> Option<&str> {
        self.models.first().map(|m| m.as_str())
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Whether the primary model supports native tool calling
    pub fn supports_tools(&self) -> bool {
        self.primary()
            .map(|m| self.port.supports_tools(m))
            .unwrap_or(false)
    }

    /// Non-streaming generation with fallback
    pub async fn generate(&self, messages: &[Message]) -> Result<Completion> {
        let mut last_err: Option<anyhow::Error> = None;

        for (attempt, model) in self.models.iter().enumerate() {
            debug!("generate: attempt {} with model {}", attempt + 1, model);
            match self.port.generate(messages, model, self.temperature).await {
                Ok(completion) => {
                    if attempt > 0 {
                        info!("Fallback model {} answered after {} failure(s)", model, attempt);
                    }
                    return Ok(completion);
                }
                Err(e) => {
                    self.log_failure(model, &e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ModelError::NoModels.into()))
    }

    /// Streaming generation with fallback.
    ///
    /// Returns the id of the model that produced the stream.
    pub async fn generate_stream(&self, messages: &[Message]) -> Result<(String, TextStream)> {
        let mut last_err: Option<anyhow::Error> = None;

        for (attempt, model) in self.models.iter().enumerate() {
            debug!("generate_stream: attempt {} with model {}", attempt + 1, model);
            let opened = self.port.generate_stream(messages, model, self.temperature).await;
            let mut inner = match opened {
                Ok(s) => s,
                Err(e) => {
                    self.log_failure(model, &e);
                    last_err = Some(e);
                    continue;
                }
            };

            match inner.next().await {
                Some(Err(e)) => {
                    self.log_failure(model, &e);
                    last_err = Some(e);
                }
                Some(Ok(first)) => {
                    if attempt > 0 {
                        info!("Fallback model {} streaming after {} failure(s)", model, attempt);
                    }
                    let stream = stream::once(async move { Ok(first) }).chain(inner).boxed();
                    return Ok((model.clone(), stream));
                }
                None => return Ok((model.clone(), stream::empty().boxed())),
            }
        }

        Err(last_err.unwrap_or_else(|| ModelError::NoModels.into()))
    }

    /// Native tool-calling turn with fallback
    pub async fn chat_with_tools(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<ToolTurn> {
        let mut last_err: Option<anyhow::Error> = None;

        for model in &self.models {
            match self.port.chat_with_tools(messages, tools, model, self.temperature).await {
                Ok(turn) => return Ok(turn),
                Err(e) => {
                    self.log_failure(model, &e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ModelError::NoModels.into()))
    }

    /// Streaming native tool-calling turn with fallback (same first-chunk rule as text streams)
    pub async fn chat_with_tools_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<(String, ToolTurnStream)> {
        let mut last_err: Option<anyhow::Error> = None;

        for model in &self.models {
            let mut inner = match self.port.chat_with_tools_stream(messages, tools, model, self.temperature).await {
                Ok(s) => s,
                Err(e) => {
                    self.log_failure(model, &e);
                    last_err = Some(e);
                    continue;
                }
            };

            match inner.next().await {
                Some(Err(e)) => {
                    self.log_failure(model, &e);
                    last_err = Some(e);
                }
                Some(Ok(first)) => {
                    let stream = stream::once(async move { Ok(first) }).chain(inner).boxed();
                    return Ok((model.clone(), stream));
                }
                None => return Ok((model.clone(), stream::empty().boxed())),
            }
        }

        Err(last_err.unwrap_or_else(|| ModelError::NoModels.into()))
    }

    fn log_failure(&self, model: &str, err: &anyhow::Error) {
        let class = FailureClass::from_error(&err.to_string());
        warn!("Model {} failed ({}): {}", model, class.as_str(), err);
    }
}
