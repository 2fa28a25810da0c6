//! Pipeline runner
//!
//! Walks a compiled [`Graph`] from its entry node until a terminal, failing
//! fatally once the step limit is exceeded. Runs can be bound to a session id:
//! the state is checkpointed after every node and a second concurrent run of
//! the same session is refused.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::events::{EventSink, EventStream, StreamEvent};
use super::graph::Graph;
use super::state::PipelineState;
use super::PipelineError;

/// Execution limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineLimits {
    /// Maximum node executions per run
    pub step_limit: usize,
    /// Bounded event channel size for streaming runs
    pub channel_capacity: usize,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            step_limit: 32,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Default)]
struct SessionEntry {
    state: Option<PipelineState>,
    busy: bool,
    runs: u64,
    updated_at: Option<DateTime<Utc>>,
}

/// In-memory session checkpoints. Not durable across restarts.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

/// Marks a session busy until dropped
pub struct SessionGuard {
    store: Arc<SessionStore>,
    id: String,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.store.sessions.lock().get_mut(&self.id) {
            entry.busy = false;
        }
    }
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim a session for one run
    pub fn acquire(self: &Arc<Self>, id: &str) -> Result<SessionGuard, PipelineError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(id.to_string()).or_default();
        if entry.busy {
            return Err(PipelineError::SessionBusy(id.to_string()));
        }
        entry.busy = true;
        entry.runs += 1;

        Ok(SessionGuard {
            store: Arc::clone(self),
            id: id.to_string(),
        })
    }

    pub fn checkpoint(&self, id: &str, state: &PipelineState) {
        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(id.to_string()).or_default();
        entry.state = Some(state.clone());
        entry.updated_at = Some(Utc::now());
    }

    /// Copy of the latest checkpoint
    pub fn snapshot(&self, id: &str) -> Option<PipelineState> {
        self.sessions.lock().get(id).and_then(|e| e.state.clone())
    }

    /// Replace a session's checkpoint, e.g. from a caller-persisted snapshot
    pub fn restore(&self, id: &str, state: PipelineState) -> Result<(), PipelineError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(id.to_string()).or_default();
        if entry.busy {
            return Err(PipelineError::SessionBusy(id.to_string()));
        }
        entry.state = Some(state);
        entry.updated_at = Some(Utc::now());
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<PipelineState> {
        let mut sessions = self.sessions.lock();
        match sessions.get(id) {
            Some(entry) if entry.busy => None,
            Some(_) => sessions.remove(id).and_then(|e| e.state),
            None => None,
        }
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.sessions.lock().get(id).map(|e| e.busy).unwrap_or(false)
    }

    /// Number of runs started for a session
    pub fn run_count(&self, id: &str) -> u64 {
        self.sessions.lock().get(id).map(|e| e.runs).unwrap_or(0)
    }

    pub fn last_updated(&self, id: &str) -> Option<DateTime<Utc>> {
        self.sessions.lock().get(id).and_then(|e| e.updated_at)
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Runnable graph
#[derive(Clone)]
pub struct CompiledPipeline {
    graph: Arc<Graph>,
    sessions: Arc<SessionStore>,
    limits: PipelineLimits,
}

impl CompiledPipeline {
    pub fn new(graph: Graph, limits: PipelineLimits) -> Self {
        Self {
            graph: Arc::new(graph),
            sessions: SessionStore::new(),
            limits,
        }
    }

    /// Share a session store with other pipelines
    pub fn with_sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn limits(&self) -> PipelineLimits {
        self.limits
    }

    /// Same graph and sessions under a different step limit
    pub fn with_step_limit(&self, step_limit: usize) -> Self {
        Self {
            graph: Arc::clone(&self.graph),
            sessions: Arc::clone(&self.sessions),
            limits: PipelineLimits {
                step_limit,
                ..self.limits
            },
        }
    }

    /// Synchronous run: returns the final state
    pub async fn run(&self, input: PipelineState, session_id: Option<&str>) -> Result<PipelineState> {
        self.run_with_sink(input, session_id, &EventSink::disabled()).await
    }

    /// Run while emitting node events into `sink`
    pub async fn run_with_sink(
        &self,
        input: PipelineState,
        session_id: Option<&str>,
        sink: &EventSink,
    ) -> Result<PipelineState> {
        let guard = match session_id {
            Some(id) => Some(self.sessions.acquire(id)?),
            None => None,
        };

        let mut state = match guard.as_ref().and_then(|g| self.sessions.snapshot(g.id())) {
            Some(mut checkpoint) => {
                debug!("Resuming session from checkpoint at {:?}", checkpoint.current_step);
                checkpoint.merge_from(&input);
                checkpoint
            }
            None => input,
        };

        let mut current = self.graph.entry().to_string();
        let mut steps = 0usize;

        loop {
            if steps >= self.limits.step_limit {
                warn!("Step limit {} exceeded at node {}", self.limits.step_limit, current);
                return Err(PipelineError::StepLimitExceeded {
                    limit: self.limits.step_limit,
                    last_node: current,
                }
                .into());
            }

            let node = self.graph.node(&current)?;
            sink.node_started(&current);
            debug!("Entering node {} (step {})", current, steps + 1);

            state = match node.run(state, sink).await {
                Ok(next) => next,
                Err(e) => {
                    if let Some(PipelineError::Cancelled) = e.downcast_ref::<PipelineError>() {
                        return Err(e);
                    }
                    warn!("Node {} failed: {:#}", current, e);
                    return Err(PipelineError::NodeFailed {
                        node: current,
                        message: format!("{:#}", e),
                    }
                    .into());
                }
            };

            state.complete_step(&current);
            steps += 1;
            if let Some(g) = &guard {
                self.sessions.checkpoint(g.id(), &state);
            }

            match self.graph.next(&current, &state)? {
                Some(next) => current = next,
                None => break,
            }
        }

        info!("Pipeline finished after {} step(s) at {}", steps, current);
        Ok(state)
    }

    /// Streaming run.
    ///
    /// The returned stream ends with exactly one `done` (carrying the final
    /// state) or `error` event. Dropping the stream cancels the run, including
    /// any in-flight model call.
    pub fn run_streaming(&self, input: PipelineState, session_id: Option<String>) -> EventStream {
        let (sink, stream) = EventSink::channel(self.limits.channel_capacity);
        let pipeline = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                result = pipeline.run_with_sink(input, session_id.as_deref(), &sink) => {
                    let terminal = match result {
                        Ok(state) => StreamEvent::done(serde_json::to_value(&state).unwrap_or_default()),
                        Err(e) => StreamEvent::error(format!("{:#}", e)),
                    };
                    if sink.emit(terminal).await.is_err() {
                        debug!("Consumer gone before terminal event");
                    }
                }
                _ = sink.closed() => {
                    info!("Stream consumer dropped, run cancelled");
                }
            }
        });

        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::events::EventTag;
    use crate::pipeline::graph::{GraphBuilder, Node, END};
    use async_trait::async_trait;
    use tokio_stream::StreamExt;

    /// Increments retry_count and emits one event
    struct Bump;

    #[async_trait]
    impl Node for Bump {
        fn name(&self) -> &'static str {
            "bump"
        }

        async fn run(&self, mut state: PipelineState, sink: &EventSink) -> Result<PipelineState> {
            state.retry_count += 1;
            sink.emit(StreamEvent::new(EventTag::Content, format!("{}", state.retry_count)).from_node("bump"))
                .await?;
            Ok(state)
        }
    }

    struct Fails;

    #[async_trait]
    impl Node for Fails {
        fn name(&self) -> &'static str {
            "fails"
        }

        async fn run(&self, _state: PipelineState, _sink: &EventSink) -> Result<PipelineState> {
            anyhow::bail!("model chain exhausted")
        }
    }

    /// Blocks until the run is cancelled
    struct Hangs;

    #[async_trait]
    impl Node for Hangs {
        fn name(&self) -> &'static str {
            "hangs"
        }

        async fn run(&self, state: PipelineState, _sink: &EventSink) -> Result<PipelineState> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(state)
        }
    }

    fn loop_until_three(state: &PipelineState) -> &'static str {
        if state.retry_count < 3 {
            "again"
        } else {
            "stop"
        }
    }

    fn counting_pipeline(step_limit: usize) -> CompiledPipeline {
        let graph = GraphBuilder::new()
            .add_node(Bump)
            .set_entry("bump")
            .add_conditional_edges("bump", loop_until_three, &[("again", "bump"), ("stop", END)])
            .compile()
            .unwrap();
        CompiledPipeline::new(
            graph,
            PipelineLimits {
                step_limit,
                channel_capacity: 2,
            },
        )
    }

    #[tokio::test]
    async fn test_back_edge_until_terminal() {
        let pipeline = counting_pipeline(10);
        let state = pipeline.run(PipelineState::default(), None).await.unwrap();
        assert_eq!(state.retry_count, 3);
        assert_eq!(state.current_step.as_deref(), Some("bump"));
        assert_eq!(state.trail.len(), 3);
    }

    #[tokio::test]
    async fn test_step_limit_is_fatal() {
        let pipeline = counting_pipeline(2);
        let err = pipeline.run(PipelineState::default(), None).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::StepLimitExceeded { limit: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_node_failure_is_fatal() {
        let graph = GraphBuilder::new().add_node(Fails).set_entry("fails").compile().unwrap();
        let pipeline = CompiledPipeline::new(graph, PipelineLimits::default());

        let err = pipeline.run(PipelineState::default(), None).await.unwrap_err();
        assert!(err.to_string().contains("model chain exhausted"));
    }

    #[tokio::test]
    async fn test_session_checkpoint_and_resume() {
        let pipeline = counting_pipeline(10);

        pipeline.run(PipelineState::new("first"), Some("s1")).await.unwrap();
        let snapshot = pipeline.sessions().snapshot("s1").unwrap();
        assert_eq!(snapshot.retry_count, 3);

        // resumed run starts from the checkpoint, so one more bump reaches the terminal
        let state = pipeline.run(PipelineState::new("second"), Some("s1")).await.unwrap();
        assert_eq!(state.task, "second");
        assert_eq!(state.retry_count, 4);
        assert_eq!(pipeline.sessions().run_count("s1"), 2);
        assert!(!pipeline.sessions().is_busy("s1"));
    }

    #[tokio::test]
    async fn test_resumed_session_drops_stale_validation() {
        let sessions = SessionStore::new();
        let mut saved = PipelineState::new("earlier");
        saved.retry_count = 2;
        saved.validation_passed = Some(true);
        saved.validation_output = Some("1 check(s) passed".into());
        sessions.restore("s", saved).unwrap();

        let pipeline = counting_pipeline(10).with_sessions(Arc::clone(&sessions));
        let state = pipeline.run(PipelineState::new("later"), Some("s")).await.unwrap();
        assert_eq!(state.retry_count, 3);
        assert!(state.validation_passed.is_none());
        assert!(state.validation_output.is_none());
    }

    #[tokio::test]
    async fn test_step_limit_override_shares_sessions() {
        let pipeline = counting_pipeline(2);
        assert!(pipeline.run(PipelineState::default(), None).await.is_err());

        let wider = pipeline.with_step_limit(5);
        assert_eq!(wider.limits().step_limit, 5);
        assert_eq!(wider.limits().channel_capacity, 2);
        wider.run(PipelineState::default(), Some("w")).await.unwrap();
        assert_eq!(pipeline.sessions().run_count("w"), 1);
        assert_eq!(pipeline.limits().step_limit, 2);
    }

    #[tokio::test]
    async fn test_concurrent_run_of_same_session_refused() {
        let sessions = SessionStore::new();
        let _guard = sessions.acquire("busy").unwrap();

        let pipeline = counting_pipeline(10).with_sessions(Arc::clone(&sessions));
        let err = pipeline.run(PipelineState::default(), Some("busy")).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::SessionBusy("busy".into()))
        );

        // other sessions are unaffected
        assert!(pipeline.run(PipelineState::default(), Some("other")).await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_snapshot() {
        let sessions = SessionStore::new();
        let mut saved = PipelineState::new("saved");
        saved.retry_count = 2;
        sessions.restore("s", saved).unwrap();

        let pipeline = counting_pipeline(10).with_sessions(Arc::clone(&sessions));
        let state = pipeline.run(PipelineState::new("saved"), Some("s")).await.unwrap();
        assert_eq!(state.retry_count, 3);
    }

    #[tokio::test]
    async fn test_streaming_ends_with_done() {
        let pipeline = counting_pipeline(10);
        let events: Vec<StreamEvent> = pipeline
            .run_streaming(PipelineState::default(), None)
            .collect()
            .await;

        let tags: Vec<EventTag> = events.iter().map(|e| e.tag).collect();
        assert_eq!(
            tags,
            vec![EventTag::Content, EventTag::Content, EventTag::Content, EventTag::Done]
        );
        let final_state: PipelineState =
            serde_json::from_value(events[3].data.clone().unwrap()).unwrap();
        assert_eq!(final_state.retry_count, 3);
    }

    #[tokio::test]
    async fn test_streaming_error_is_terminal() {
        let pipeline = counting_pipeline(1);
        let events: Vec<StreamEvent> = pipeline
            .run_streaming(PipelineState::default(), None)
            .collect()
            .await;

        let last = events.last().unwrap();
        assert_eq!(last.tag, EventTag::Error);
        assert!(last.content.contains("step limit"));
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_run() {
        let graph = GraphBuilder::new().add_node(Hangs).set_entry("hangs").compile().unwrap();
        let pipeline = CompiledPipeline::new(graph, PipelineLimits::default());

        let stream = pipeline.run_streaming(PipelineState::default(), Some("hang".into()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(pipeline.sessions().is_busy("hang"));

        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pipeline.sessions().is_busy("hang"));
    }
}
