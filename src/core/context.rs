//! Run-scoped mutable execution state.
//!
//! One [`ExecutionContext`] exists per run, owned by that run for its whole
//! lifetime and discarded afterwards. Handlers receive `&ExecutionContext`;
//! the mutable maps sit behind `parking_lot` locks so independent handler
//! futures of one scheduling pass can record their results concurrently.
//! No lock is held across an await point.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::core::block_ref::BlockRef;
use crate::core::events::{EventSender, ExecutionEvent};
use crate::core::stream::{OutputChunk, StreamWriter};
use crate::workflow::schema::ParallelType;

// ============================================================
// State records
// ============================================================

/// What one executable unit produced.
#[derive(Debug, Clone, Serialize)]
pub struct BlockState {
    pub output: Value,
    pub executed: bool,
    pub execution_time_ms: u64,
}

/// Evaluated fan-out source for a parallel region.
#[derive(Debug, Clone, PartialEq)]
pub enum DistributionItems {
    /// Count-based fan-out with no bound collection.
    None,
    /// Distribution expression failed to evaluate. The region stays in
    /// waiting and never completes; the run is not failed.
    Unavailable,
    List(Vec<Value>),
    Keyed(Vec<(String, Value)>),
}

impl DistributionItems {
    pub fn len(&self) -> usize {
        match self {
            DistributionItems::None | DistributionItems::Unavailable => 0,
            DistributionItems::List(items) => items.len(),
            DistributionItems::Keyed(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn item(&self, index: usize) -> Option<&Value> {
        match self {
            DistributionItems::None | DistributionItems::Unavailable => None,
            DistributionItems::List(items) => items.get(index),
            DistributionItems::Keyed(items) => items.get(index).map(|(_, v)| v),
        }
    }

    /// Key for keyed-object distributions.
    pub fn key(&self, index: usize) -> Option<&str> {
        match self {
            DistributionItems::Keyed(items) => items.get(index).map(|(k, _)| k.as_str()),
            _ => None,
        }
    }
}

/// Fan-out bookkeeping for one active parallel region.
#[derive(Debug, Clone)]
pub struct ParallelState {
    pub parallel_count: usize,
    pub distribution_items: DistributionItems,
    pub completed_executions: usize,
    /// Final result per iteration index; ordered into the aggregate on
    /// completion.
    pub execution_results: HashMap<usize, Value>,
    pub active_iterations: HashSet<usize>,
    pub current_iteration: usize,
    pub parallel_type: ParallelType,
}

impl ParallelState {
    pub fn new(
        parallel_count: usize,
        distribution_items: DistributionItems,
        parallel_type: ParallelType,
    ) -> Self {
        Self {
            parallel_count,
            distribution_items,
            completed_executions: 0,
            execution_results: HashMap::new(),
            active_iterations: (0..parallel_count).collect(),
            current_iteration: 0,
            parallel_type,
        }
    }
}

/// Iteration bookkeeping for one active loop region.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub total_iterations: usize,
    /// Bound collection for forEach loops.
    pub items: Option<Vec<Value>>,
    pub current_iteration: usize,
    /// Final result per completed iteration, in order.
    pub results: Vec<Value>,
}

impl LoopState {
    pub fn new(total_iterations: usize, items: Option<Vec<Value>>) -> Self {
        Self {
            total_iterations,
            items,
            current_iteration: 0,
            results: Vec::new(),
        }
    }
}

/// Per-block execution record, ordered by completion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockLog {
    /// Flattened block key; virtual instances use the
    /// `{node}_{kind}_{region}_iteration_{i}` form.
    pub block_id: String,
    pub block_name: String,
    pub block_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub output: Value,
}

/// Callback invoked for every streamed chunk, alongside the buffered
/// stream.
pub type OnStreamCallback = Arc<dyn Fn(&OutputChunk) + Send + Sync>;

/// Streaming request attached to a run.
#[derive(Clone)]
pub struct StreamingContext {
    /// Blocks whose output may stream live.
    pub selected_outputs: HashSet<String>,
    pub writer: StreamWriter,
    pub on_stream: Option<OnStreamCallback>,
}

/// Clonable handle that aborts the owning run.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub(crate) fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ============================================================
// Execution context
// ============================================================

/// Mutable state threaded through one workflow run.
pub struct ExecutionContext {
    workflow_id: String,
    execution_id: String,
    started_at: DateTime<Utc>,
    environment_variables: HashMap<String, Value>,
    workflow_variables: HashMap<String, Value>,
    workflow_input: Value,
    nesting_depth: usize,

    block_states: RwLock<HashMap<BlockRef, BlockState>>,
    executed_blocks: RwLock<HashSet<BlockRef>>,
    active_execution_path: RwLock<HashSet<String>>,
    router_decisions: RwLock<HashMap<BlockRef, String>>,
    condition_decisions: RwLock<HashMap<BlockRef, bool>>,
    loop_states: RwLock<HashMap<String, LoopState>>,
    parallel_executions: RwLock<HashMap<String, ParallelState>>,
    completed_subflows: RwLock<HashSet<String>>,
    block_logs: Mutex<Vec<BlockLog>>,
    last_output: RwLock<Value>,

    steps: AtomicU32,
    cancelled: Arc<AtomicBool>,
    did_stream: AtomicBool,
    streaming: Option<StreamingContext>,
    events: Option<EventSender>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            environment_variables: HashMap::new(),
            workflow_variables: HashMap::new(),
            workflow_input: Value::Null,
            nesting_depth: 0,
            block_states: RwLock::new(HashMap::new()),
            executed_blocks: RwLock::new(HashSet::new()),
            active_execution_path: RwLock::new(HashSet::new()),
            router_decisions: RwLock::new(HashMap::new()),
            condition_decisions: RwLock::new(HashMap::new()),
            loop_states: RwLock::new(HashMap::new()),
            parallel_executions: RwLock::new(HashMap::new()),
            completed_subflows: RwLock::new(HashSet::new()),
            block_logs: Mutex::new(Vec::new()),
            last_output: RwLock::new(Value::Null),
            steps: AtomicU32::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
            did_stream: AtomicBool::new(false),
            streaming: None,
            events: None,
        }
    }

    pub fn with_environment(mut self, vars: HashMap<String, Value>) -> Self {
        self.environment_variables = vars;
        self
    }

    pub fn with_workflow_variables(mut self, vars: HashMap<String, Value>) -> Self {
        self.workflow_variables = vars;
        self
    }

    pub fn with_workflow_input(mut self, input: Value) -> Self {
        self.workflow_input = input;
        self
    }

    pub fn with_streaming(mut self, streaming: StreamingContext) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// How many workflow blocks deep this run sits. The root run is 0.
    pub fn with_nesting_depth(mut self, depth: usize) -> Self {
        self.nesting_depth = depth;
        self
    }

    /// Share a cancellation flag owned by the executor, so a handle taken
    /// before the run starts aborts it.
    pub(crate) fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn environment_variables(&self) -> &HashMap<String, Value> {
        &self.environment_variables
    }

    pub fn workflow_variables(&self) -> &HashMap<String, Value> {
        &self.workflow_variables
    }

    pub fn workflow_input(&self) -> &Value {
        &self.workflow_input
    }

    pub fn nesting_depth(&self) -> usize {
        self.nesting_depth
    }

    // ============================================================
    // Block states
    // ============================================================

    /// Record a block's output and mark it executed. A block that failed is
    /// recorded the same way with an `{"error": ...}` output.
    pub fn record_output(&self, block: &BlockRef, output: Value, execution_time_ms: u64) {
        self.block_states.write().insert(
            block.clone(),
            BlockState {
                output,
                executed: true,
                execution_time_ms,
            },
        );
        self.executed_blocks.write().insert(block.clone());
    }

    /// Seed a block state supplied by the caller (deterministic tests,
    /// debug resume). Seeded blocks count as executed and reachable.
    pub fn seed_block_state(&self, block_id: &str, output: Value) {
        let block = BlockRef::real(block_id);
        self.record_output(&block, output, 0);
        self.add_to_path(block_id);
    }

    pub fn is_executed(&self, block: &BlockRef) -> bool {
        self.executed_blocks.read().contains(block)
    }

    pub fn executed_len(&self) -> usize {
        self.executed_blocks.read().len()
    }

    pub fn block_output(&self, block: &BlockRef) -> Option<Value> {
        self.block_states.read().get(block).map(|s| s.output.clone())
    }

    /// Whether an executed block recorded a failure-shaped output.
    pub fn output_has_error(&self, block: &BlockRef) -> bool {
        self.block_states
            .read()
            .get(block)
            .map(|s| s.output.get("error").is_some())
            .unwrap_or(false)
    }

    /// Output lookup for a reference resolved inside `scope`: when the
    /// consuming unit is a virtual instance and the referenced node is a
    /// body sibling, that iteration's instance wins over the real id.
    pub fn output_for_reference(&self, scope: &BlockRef, node_id: &str) -> Option<Value> {
        if let Some(sibling) = scope.sibling(node_id) {
            if let Some(state) = self.block_states.read().get(&sibling) {
                return Some(state.output.clone());
            }
        }
        self.block_output(&BlockRef::real(node_id))
    }

    // ============================================================
    // Active execution path
    // ============================================================

    pub fn add_to_path(&self, block_id: &str) {
        self.active_execution_path
            .write()
            .insert(block_id.to_string());
    }

    pub fn is_in_path(&self, block_id: &str) -> bool {
        self.active_execution_path.read().contains(block_id)
    }

    pub fn path_snapshot(&self) -> HashSet<String> {
        self.active_execution_path.read().clone()
    }

    // ============================================================
    // Decisions
    // ============================================================

    pub fn set_router_decision(&self, block: &BlockRef, target: &str) {
        self.router_decisions
            .write()
            .insert(block.clone(), target.to_string());
    }

    pub fn router_decision(&self, block: &BlockRef) -> Option<String> {
        self.router_decisions.read().get(block).cloned()
    }

    pub fn set_condition_decision(&self, block: &BlockRef, result: bool) {
        self.condition_decisions.write().insert(block.clone(), result);
    }

    pub fn condition_decision(&self, block: &BlockRef) -> Option<bool> {
        self.condition_decisions.read().get(block).copied()
    }

    pub fn has_decision(&self, block: &BlockRef) -> bool {
        self.router_decisions.read().contains_key(block)
            || self.condition_decisions.read().contains_key(block)
    }

    // ============================================================
    // Loop state
    // ============================================================

    pub fn init_loop(&self, loop_id: &str, state: LoopState) {
        self.loop_states
            .write()
            .entry(loop_id.to_string())
            .or_insert(state);
    }

    pub fn loop_state(&self, loop_id: &str) -> Option<LoopState> {
        self.loop_states.read().get(loop_id).cloned()
    }

    pub fn has_loop_state(&self, loop_id: &str) -> bool {
        self.loop_states.read().contains_key(loop_id)
    }

    /// Current 0-based iteration index of an active loop.
    pub fn loop_index(&self, loop_id: &str) -> usize {
        self.loop_states
            .read()
            .get(loop_id)
            .map(|s| s.current_iteration)
            .unwrap_or(0)
    }

    /// The item bound to an iteration of a forEach loop.
    pub fn loop_item(&self, loop_id: &str, iteration: usize) -> Option<Value> {
        self.loop_states
            .read()
            .get(loop_id)
            .and_then(|s| s.items.as_ref())
            .and_then(|items| items.get(iteration).cloned())
    }

    /// Mutate a loop's state in place; returns `None` for unknown loops.
    pub fn with_loop_state<R>(
        &self,
        loop_id: &str,
        f: impl FnOnce(&mut LoopState) -> R,
    ) -> Option<R> {
        self.loop_states.write().get_mut(loop_id).map(f)
    }

    // ============================================================
    // Parallel state
    // ============================================================

    pub fn init_parallel(&self, parallel_id: &str, state: ParallelState) {
        self.parallel_executions
            .write()
            .entry(parallel_id.to_string())
            .or_insert(state);
    }

    pub fn parallel_state(&self, parallel_id: &str) -> Option<ParallelState> {
        self.parallel_executions.read().get(parallel_id).cloned()
    }

    pub fn has_parallel_state(&self, parallel_id: &str) -> bool {
        self.parallel_executions.read().contains_key(parallel_id)
    }

    /// The item bound to one iteration of a collection parallel.
    pub fn parallel_item(&self, parallel_id: &str, iteration: usize) -> Option<Value> {
        self.parallel_executions
            .read()
            .get(parallel_id)
            .and_then(|s| s.distribution_items.item(iteration).cloned())
    }

    /// Mutate a parallel's state in place; returns `None` for unknown
    /// regions.
    pub fn with_parallel_state<R>(
        &self,
        parallel_id: &str,
        f: impl FnOnce(&mut ParallelState) -> R,
    ) -> Option<R> {
        self.parallel_executions.write().get_mut(parallel_id).map(f)
    }

    // ============================================================
    // Completed subflows
    // ============================================================

    /// Mark a loop/parallel region finalized. Returns `false` when it was
    /// already complete, so aggregation stays idempotent.
    pub fn complete_subflow(&self, region_id: &str) -> bool {
        self.completed_subflows.write().insert(region_id.to_string())
    }

    pub fn is_subflow_completed(&self, region_id: &str) -> bool {
        self.completed_subflows.read().contains(region_id)
    }

    pub fn completed_subflows_len(&self) -> usize {
        self.completed_subflows.read().len()
    }

    // ============================================================
    // Logs, output, limits
    // ============================================================

    pub fn push_log(&self, log: BlockLog) {
        self.block_logs.lock().push(log);
    }

    pub fn logs_snapshot(&self) -> Vec<BlockLog> {
        self.block_logs.lock().clone()
    }

    pub fn set_last_output(&self, output: Value) {
        *self.last_output.write() = output;
    }

    pub fn last_output(&self) -> Value {
        self.last_output.read().clone()
    }

    /// Count one block execution against the step limit; returns the new
    /// total.
    pub fn increment_steps(&self) -> u32 {
        self.steps.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn steps(&self) -> u32 {
        self.steps.load(Ordering::Relaxed)
    }

    // ============================================================
    // Cancellation, streaming, events
    // ============================================================

    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            flag: self.cancelled.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn streaming_enabled(&self) -> bool {
        self.streaming.is_some()
    }

    /// Whether this block was selected for live output.
    pub fn stream_selected(&self, block_id: &str) -> bool {
        self.streaming
            .as_ref()
            .map(|s| s.selected_outputs.contains(block_id))
            .unwrap_or(false)
    }

    /// Forward one chunk to the run-level stream and callback.
    pub fn write_chunk(&self, block_id: &str, content: &str) {
        let Some(streaming) = &self.streaming else {
            return;
        };
        self.did_stream.store(true, Ordering::Relaxed);
        streaming.writer.write(block_id, content);
        if let Some(callback) = &streaming.on_stream {
            callback(&OutputChunk {
                block_id: block_id.to_string(),
                content: content.to_string(),
            });
        }
        self.emit(ExecutionEvent::StreamChunk {
            block_id: block_id.to_string(),
            content: content.to_string(),
        });
    }

    /// Whether any block streamed output during this run.
    pub fn did_stream(&self) -> bool {
        self.did_stream.load(Ordering::Relaxed)
    }

    pub fn end_stream(&self) {
        if let Some(streaming) = &self.streaming {
            streaming.writer.end();
        }
    }

    pub fn emit(&self, event: ExecutionEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }
}
