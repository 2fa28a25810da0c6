//! Code-generation workflow
//!
//! ```text
//! classify_intent ─┬─ greeting/help ─▶ (canned answer, end)
//!                  └─ otherwise ─▶ plan ─▶ retrieve ─▶ write_tests ─▶ write_code ─▶ validate ─▶ end
//! ```
//!
//! A failed validation is not retried here; it surfaces in the final state.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::{extract_code, generate_into, prompts, Services};
use crate::pipeline::{
    CompiledPipeline, EventSink, EventStream, EventTag, GraphBuilder, Node, PipelineLimits, PipelineState,
    StreamEvent, END,
};
use crate::retrieval::retrieve_context;
use crate::router::IntentRouter;
use crate::sandbox::ValidationRequest;

struct ClassifyIntent {
    router: IntentRouter,
    services: Arc<Services>,
}

#[async_trait]
impl Node for ClassifyIntent {
    fn name(&self) -> &'static str {
        "classify_intent"
    }

    async fn run(&self, mut state: PipelineState, sink: &EventSink) -> Result<PipelineState> {
        let classification = self.router.classify(&state.task);
        let choice = self.services.selector.select(&state.task);
        debug!(
            "Intent {} (tier {}, {:.2}): {}",
            classification.intent.as_str(),
            choice.tier.as_str(),
            classification.confidence,
            classification.reasoning
        );

        state.intent = Some(classification.intent);
        state.model_tier = Some(choice.tier);
        state.primary_model = Some(choice.primary);
        state.fallback_model = Some(choice.fallback);

        if let Some(canned) = classification.intent.canned_response() {
            state.response = Some(canned.to_string());
            sink.emit(StreamEvent::new(EventTag::Content, canned).from_node(self.name()))
                .await?;
        }
        Ok(state)
    }
}

fn after_intent(state: &PipelineState) -> &'static str {
    match state.intent.and_then(|i| i.canned_response()) {
        Some(_) => "respond",
        None => "generate",
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
        let messages = prompts::plan_messages(&state);
        let generated = generate_into(&chain, &messages, sink, EventTag::Plan, self.name()).await?;

        state.plan = Some(generated.content.trim().to_string());
        state.model_used = Some(generated.model);
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
        let settings = &self.services.settings;
        let context = retrieve_context(
            self.services.retrieval(),
            &state.task,
            settings.retrieval_limit,
            settings.retrieval_min_score,
        )
        .await;

        state.retrieved_context = Some(context);
        Ok(state)
    }
}

struct WriteTests {
    services: Arc<Services>,
}

#[async_trait]
impl Node for WriteTests {
    fn name(&self) -> &'static str {
        "write_tests"
    }

    async fn run(&self, mut state: PipelineState, sink: &EventSink) -> Result<PipelineState> {
        let chain = self.services.chain_for(&mut state);
        let messages = prompts::tests_messages(&state);
        let generated = generate_into(&chain, &messages, sink, EventTag::Tests, self.name()).await?;

        state.tests = Some(extract_code(&generated.content));
        state.model_used = Some(generated.model);
        Ok(state)
    }
}

struct WriteCode {
    services: Arc<Services>,
}

#[async_trait]
impl Node for WriteCode {
    fn name(&self) -> &'static str {
        "write_code"
    }

    async fn run(&self, mut state: PipelineState, sink: &EventSink) -> Result<PipelineState> {
        let chain = self.services.chain_for(&mut state);
        let messages = prompts::code_messages(&state);
        let generated = generate_into(&chain, &messages, sink, EventTag::Code, self.name()).await?;

        state.code = Some(extract_code(&generated.content));
        state.code_attempts += 1;
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
        let mut request = ValidationRequest::new(&code).with_tests(state.tests.as_deref().unwrap_or_default());
        if let Some(path) = state.target_path.as_deref() {
            request = request.with_path(path);
        }

        let outcome = self.services.validator.validate(&request).await;
        info!(
            "Validation {} ({}, {} ms)",
            outcome.kind.as_str(),
            outcome.language.as_str(),
            outcome.duration_ms
        );

        sink.emit(
            StreamEvent::new(EventTag::Validation, outcome.diagnostic.clone())
                .from_node(self.name())
                .with_data(serde_json::to_value(&outcome)?),
        )
        .await?;

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

/// Code-generation pipeline bound to one set of services
#[derive(Clone)]
pub struct CodeGenWorkflow {
    pipeline: CompiledPipeline,
}

impl CodeGenWorkflow {
    pub fn new(services: Services, limits: PipelineLimits) -> Result<Self> {
        let services = Arc::new(services);
        let graph = GraphBuilder::new()
            .add_node(ClassifyIntent {
                router: IntentRouter::new(),
                services: Arc::clone(&services),
            })
            .add_node(Plan {
                services: Arc::clone(&services),
            })
            .add_node(Retrieve {
                services: Arc::clone(&services),
            })
            .add_node(WriteTests {
                services: Arc::clone(&services),
            })
            .add_node(WriteCode {
                services: Arc::clone(&services),
            })
            .add_node(Validate { services })
            .set_entry("classify_intent")
            .add_conditional_edges(
                "classify_intent",
                after_intent,
                &[("respond", END), ("generate", "plan")],
            )
            .add_edge("plan", "retrieve")
            .add_edge("retrieve", "write_tests")
            .add_edge("write_tests", "write_code")
            .add_edge("write_code", "validate")
            .compile()?;

        Ok(Self {
            pipeline: CompiledPipeline::new(graph, limits),
        })
    }

    pub fn pipeline(&self) -> &CompiledPipeline {
        &self.pipeline
    }

    /// Generate code for `task` and return the final state
    pub async fn run(&self, task: &str, session_id: Option<&str>) -> Result<PipelineState> {
        self.pipeline.run(PipelineState::new(task), session_id).await
    }

    /// Run from a prepared input state
    pub async fn run_state(&self, input: PipelineState, session_id: Option<&str>) -> Result<PipelineState> {
        self.pipeline.run(input, session_id).await
    }

    /// Streaming run; see [`CompiledPipeline::run_streaming`]
    pub fn run_streaming(&self, task: &str, session_id: Option<String>) -> EventStream {
        self.pipeline.run_streaming(PipelineState::new(task), session_id)
    }
}
