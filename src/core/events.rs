use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Engine events published while a run progresses.
///
/// Emission is best-effort: once the receiver is dropped, sends fail
/// silently and execution continues.
#[derive(Clone, Debug, Serialize)]
pub enum ExecutionEvent {
    BlockStarted {
        block_id: String,
        block_type: String,
        timestamp: DateTime<Utc>,
    },

    BlockCompleted {
        block_id: String,
        output: Value,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    BlockFailed {
        block_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A router or condition block fixed its outgoing branch.
    BranchSelected {
        block_id: String,
        target: String,
        timestamp: DateTime<Utc>,
    },

    /// Streamed output token from a selected block.
    StreamChunk {
        block_id: String,
        content: String,
    },

    WorkflowCompleted {
        execution_id: String,
        output: Value,
        timestamp: DateTime<Utc>,
    },

    WorkflowFailed {
        execution_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

pub type EventSender = mpsc::UnboundedSender<ExecutionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create an event channel to pass to the executor builder.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
