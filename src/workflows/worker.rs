//! Background improvement worker
//!
//! Drains a FIFO queue of improvement requests one task at a time and maps
//! node transitions to coarse task status. Stopping the worker cancels the
//! in-flight run; queued tasks stay queued and run after the next `start()`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::improve::{ImproveRequest, ImproveWorkflow};
use crate::pipeline::{EventSink, PipelineState};

/// Coarse task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Analyzing,
    Planning,
    Coding,
    Validating,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Analyzing => "analyzing",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::Validating => "validating",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Status while `node` is running; None for nodes that do not move it
    pub fn from_step(node: &str) -> Option<Self> {
        match node {
            "analyze" | "retrieve" => Some(Self::Analyzing),
            "plan" => Some(Self::Planning),
            "code" | "retry" => Some(Self::Coding),
            "validate" => Some(Self::Validating),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// One queued improvement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub request: ImproveRequest,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub result: Option<PipelineState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct Shared {
    queue: Mutex<VecDeque<String>>,
    records: Mutex<HashMap<String, TaskRecord>>,
    notify: Notify,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn set_status(&self, id: &str, status: TaskStatus) {
        if let Some(record) = self.records.lock().get_mut(id) {
            if record.status != status {
                debug!("Task {} {} -> {}", id, record.status.as_str(), status.as_str());
                record.status = status;
                record.updated_at = Utc::now();
            }
        }
    }

    fn finish(&self, id: &str, status: TaskStatus, error: Option<String>, result: Option<PipelineState>) {
        if let Some(record) = self.records.lock().get_mut(id) {
            record.status = status;
            record.error = error;
            record.result = result;
            record.updated_at = Utc::now();
        }
    }
}

/// Single-consumer improvement queue
pub struct ImprovementWorker {
    workflow: ImproveWorkflow,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ImprovementWorker {
    pub fn new(workflow: ImproveWorkflow) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            workflow,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                records: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                shutdown,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Queue a request and return its task id
    pub fn submit(&self, request: ImproveRequest) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.shared.records.lock().insert(
            id.clone(),
            TaskRecord {
                id: id.clone(),
                request,
                status: TaskStatus::Queued,
                error: None,
                result: None,
                created_at: now,
                updated_at: now,
            },
        );
        self.shared.queue.lock().push_back(id.clone());
        self.shared.notify.notify_one();
        info!("Queued improvement task {}", id);
        id
    }

    /// Put a cancelled or failed task back on the queue
    pub fn requeue(&self, id: &str) -> bool {
        let mut records = self.shared.records.lock();
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        if !matches!(record.status, TaskStatus::Cancelled | TaskStatus::Failed) {
            return false;
        }
        record.status = TaskStatus::Queued;
        record.error = None;
        record.updated_at = Utc::now();
        drop(records);

        self.shared.queue.lock().push_back(id.to_string());
        self.shared.notify.notify_one();
        true
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.shared.records.lock().get(id).map(|r| r.status)
    }

    pub fn record(&self, id: &str) -> Option<TaskRecord> {
        self.shared.records.lock().get(id).cloned()
    }

    /// Ids still waiting, in run order
    pub fn queued(&self) -> Vec<String> {
        self.shared.queue.lock().iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Start draining the queue in the background
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        self.shared.shutdown.send_replace(false);
        let shutdown = self.shared.shutdown.subscribe();
        let workflow = self.workflow.clone();
        let shared = Arc::clone(&self.shared);

        *handle = Some(tokio::spawn(run_loop(workflow, shared, shutdown)));
        info!("Improvement worker started");
    }

    /// Stop the worker, cancelling the in-flight task
    pub async fn stop(&self) {
        self.shared.shutdown.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Improvement worker ended abnormally: {}", e);
            }
        }
        info!("Improvement worker stopped ({} task(s) still queued)", self.shared.queue.lock().len());
    }
}

async fn run_loop(workflow: ImproveWorkflow, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = shared.queue.lock().pop_front();
        let Some(id) = next else {
            tokio::select! {
                _ = shared.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        process(&workflow, &shared, &id, &mut shutdown).await;
    }
}

async fn process(workflow: &ImproveWorkflow, shared: &Shared, id: &str, shutdown: &mut watch::Receiver<bool>) {
    let request = match shared.records.lock().get(id) {
        Some(record) => record.request.clone(),
        None => return,
    };
    info!("Running improvement task {} on {}", id, request.target_path);

    let (progress_tx, mut progress_rx) = watch::channel(String::new());
    let sink = EventSink::disabled().with_progress(Arc::new(progress_tx));
    let run = workflow.run_with_sink(request, None, &sink);
    tokio::pin!(run);

    let outcome = loop {
        tokio::select! {
            result = &mut run => break Some(result),
            changed = progress_rx.changed() => {
                if changed.is_ok() {
                    let step = progress_rx.borrow_and_update().clone();
                    if let Some(status) = TaskStatus::from_step(&step) {
                        shared.set_status(id, status);
                    }
                } else {
                    break Some((&mut run).await);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break None;
                }
            }
        }
    };

    match outcome {
        Some(Ok(state)) if state.succeeded() => {
            info!("Task {} done", id);
            shared.finish(id, TaskStatus::Done, None, Some(state));
        }
        Some(Ok(state)) => {
            let error = state.last_error.clone();
            warn!("Task {} failed validation", id);
            shared.finish(id, TaskStatus::Failed, error, Some(state));
        }
        Some(Err(e)) => {
            warn!("Task {} failed: {:#}", id, e);
            shared.finish(id, TaskStatus::Failed, Some(format!("{:#}", e)), None);
        }
        None => {
            info!("Task {} cancelled", id);
            shared.finish(id, TaskStatus::Cancelled, Some("worker stopped".into()), None);
        }
    }
}
