//! Codeforge
//!
//! Local coding-assistant engine that turns one request into a multi-step
//! interaction with language models, a code index and the workspace.
//!
//! # Features
//!
//! - **Pipelines**: node graph executor with guards, step limit, per-session
//!   checkpoints and ordered streaming events
//! - **Code generation**: classify → plan → retrieve → tests → code → validate
//! - **Self-improvement**: analyze → retrieve → plan → code → validate with
//!   bounded, context-enriched retries and backed-up writes
//! - **Agent**: ReAct tool loop in native or embedded-tag mode
//! - **Model chain**: ordered fallback over models, `<think>` stream decoding
//! - **Sandbox**: filtered shell and time-boxed validation in a temp directory
//!
//! # Architecture
//!
//! ```text
//! caller ──► Workflow / AgentLoop ──► ModelChain ──► ModelPort (Ollama)
//!                 │
//!                 ├── RetrievalPort (InMemoryIndex, CachedRetrieval)
//!                 ├── FilePort (LocalWorkspace)
//!                 ├── ShellPort (SandboxShell)
//!                 └── CodeValidator (SandboxValidator)
//! ```

pub mod agent;
pub mod config;
pub mod llm;
pub mod pipeline;
pub mod retrieval;
pub mod router;
pub mod sandbox;
pub mod workflows;
pub mod workspace;

pub use agent::{AgentConfig, AgentLoop, AgentOutcome, AgentRequest, ToolExecutor, ToolMode};
pub use config::EngineConfig;
pub use llm::{Message, ModelChain, ModelError, ModelPort};
pub use pipeline::{
    CompiledPipeline, EventStream, EventTag, PipelineError, PipelineLimits, PipelineState, StreamEvent,
};
pub use retrieval::{CachedRetrieval, InMemoryIndex, RetrievalPort};
pub use router::{IntentRouter, KeywordModelSelector, ModelSelector};
pub use sandbox::{CodeValidator, SandboxShell, SandboxValidator};
pub use workflows::{CodeGenWorkflow, ImproveRequest, ImproveWorkflow, ImprovementWorker, Services, TaskStatus};
pub use workspace::{FilePort, LocalWorkspace};
