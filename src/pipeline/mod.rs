//! Pipeline executor
//!
//! Generic directed-graph runner used by both workflows:
//! - `state`: the per-session `PipelineState` record
//! - `events`: tagged stream events and the bounded event sink
//! - `graph`: `Node` trait, edges, guards and the graph builder
//! - `executor`: step-limited runner, session store, sync and streaming entry points

pub mod events;
pub mod executor;
pub mod graph;
pub mod state;

pub use events::{EventSink, EventStream, EventTag, StreamEvent};
pub use executor::{CompiledPipeline, PipelineLimits, SessionGuard, SessionStore};
pub use graph::{Graph, GraphBuilder, Guard, Node, END};
pub use state::{LineRange, PipelineState};

/// Executor errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("step limit of {limit} exceeded (last node: {last_node})")]
    StepLimitExceeded { limit: usize, last_node: String },

    #[error("session '{0}' already has a run in flight")]
    SessionBusy(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("guard on '{node}' returned unknown branch '{branch}'")]
    UnknownBranch { node: String, branch: String },

    #[error("graph has no entry node")]
    MissingEntry,

    #[error("run cancelled by consumer")]
    Cancelled,

    #[error("node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },
}
