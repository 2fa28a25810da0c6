//! Stream events
//!
//! Producers write into a bounded channel; a full channel suspends the
//! producer until the consumer catches up. A dropped consumer surfaces as
//! `PipelineError::Cancelled` on the next emit.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use super::PipelineError;

/// Event tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTag {
    Plan,
    Tests,
    Code,
    Validation,
    ToolCall,
    ToolResult,
    ProposedEdit,
    Content,
    Thinking,
    Done,
    Error,
}

impl EventTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTag::Plan => "plan",
            EventTag::Tests => "tests",
            EventTag::Code => "code",
            EventTag::Validation => "validation",
            EventTag::ToolCall => "tool_call",
            EventTag::ToolResult => "tool_result",
            EventTag::ProposedEdit => "proposed_edit",
            EventTag::Content => "content",
            EventTag::Thinking => "thinking",
            EventTag::Done => "done",
            EventTag::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventTag::Done | EventTag::Error)
    }
}

/// One tagged event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub tag: EventTag,
    /// Node that produced the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl StreamEvent {
    pub fn new(tag: EventTag, content: impl Into<String>) -> Self {
        Self {
            tag,
            node: None,
            content: content.into(),
            data: None,
        }
    }

    pub fn from_node(mut self, node: &str) -> Self {
        self.node = Some(node.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn done(data: serde_json::Value) -> Self {
        Self::new(EventTag::Done, "").with_data(data)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventTag::Error, message)
    }
}

/// Consumer side of a streaming run
pub type EventStream = ReceiverStream<StreamEvent>;

/// Producer side handed to every node
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
    progress: Option<Arc<watch::Sender<String>>>,
}

impl EventSink {
    /// Sink that drops every event (synchronous runs)
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Bounded channel pair
    pub fn channel(capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                progress: None,
            },
            ReceiverStream::new(rx),
        )
    }

    /// Also publish the name of each node as it starts
    pub fn with_progress(mut self, progress: Arc<watch::Sender<String>>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// True when someone is consuming events
    pub fn is_streaming(&self) -> bool {
        self.tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    /// Send an event, waiting for channel capacity
    pub async fn emit(&self, event: StreamEvent) -> Result<(), PipelineError> {
        match &self.tx {
            Some(tx) => tx.send(event).await.map_err(|_| PipelineError::Cancelled),
            None => Ok(()),
        }
    }

    /// Announce that a node is starting
    pub fn node_started(&self, node: &str) {
        if let Some(progress) = &self.progress {
            progress.send_replace(node.to_string());
        }
    }

    /// Resolves once the consumer has gone away; never resolves for a disabled sink
    pub async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn test_tags_serialize_snake_case() {
        let event = StreamEvent::new(EventTag::ProposedEdit, "x").from_node("write");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tag"], "proposed_edit");
        assert_eq!(json["node"], "write");
        assert!(json.get("data").is_none());
        assert_eq!(EventTag::ToolCall.as_str(), "tool_call");
    }

    #[tokio::test]
    async fn test_emit_and_receive() {
        let (sink, mut stream) = EventSink::channel(4);
        assert!(sink.is_streaming());

        sink.emit(StreamEvent::new(EventTag::Plan, "step 1")).await.unwrap();
        drop(sink);

        let event = stream.next().await.unwrap();
        assert_eq!(event.tag, EventTag::Plan);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_consumer_cancels() {
        let (sink, stream) = EventSink::channel(1);
        drop(stream);

        assert!(!sink.is_streaming());
        let err = sink.emit(StreamEvent::new(EventTag::Content, "x")).await.unwrap_err();
        assert_eq!(err, PipelineError::Cancelled);
        sink.closed().await;
    }

    #[tokio::test]
    async fn test_disabled_sink_accepts_everything() {
        let sink = EventSink::disabled();
        assert!(!sink.is_streaming());
        sink.emit(StreamEvent::new(EventTag::Code, "x")).await.unwrap();
    }

    #[test]
    fn test_progress_published() {
        let (tx, rx) = watch::channel(String::new());
        let sink = EventSink::disabled().with_progress(Arc::new(tx));
        sink.node_started("plan");
        assert_eq!(*rx.borrow(), "plan");
    }
}
