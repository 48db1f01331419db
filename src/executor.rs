//! Workflow executor: the main execution driver.
//!
//! [`Executor`] walks the serialized graph in passes. Each pass collects
//! every block whose dependencies are satisfied (real blocks on the
//! active path plus virtual instances of active loop/parallel regions),
//! runs them concurrently, then applies the outcomes: outputs are
//! recorded, branch decisions prune the path, failures either follow an
//! error connection or end the run. The pass loop terminates when
//! nothing is ready, when a pass makes no progress, or when a limit
//! trips.
//!
//! Execution state lives in a single [`ExecutionContext`] owned by the
//! run and passed explicitly to every handler; the executor itself stays
//! immutable and can drive multiple runs.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::ExecutorConfig;
use crate::core::block_ref::BlockRef;
use crate::core::context::{
    BlockLog, CancellationHandle, ExecutionContext, OnStreamCallback, StreamingContext,
};
use crate::core::events::{EventSender, ExecutionEvent};
use crate::core::loop_manager::LoopManager;
use crate::core::parallel_manager::ParallelManager;
use crate::core::path::PathTracker;
use crate::core::stream::{channel, OutputStream};
use crate::error::{BlockError, WorkflowError, WorkflowResult};
use crate::handlers::{ExecutionScope, HandlerRegistry, WorkflowSource};
use crate::provider::ProviderClient;
use crate::resolver::Resolver;
use crate::workflow::schema::{BlockKind, ConnectionHandle, SerializedBlock, SerializedWorkflow};
use crate::workflow::validate_workflow;

// ============================================================
// Results
// ============================================================

/// Timing of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub duration_ms: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Final state of a run.
///
/// A block failure that no error connection absorbed ends the run with
/// `success: false`; engine-level aborts (limits, cancellation, invalid
/// graphs) surface as [`WorkflowError`] instead.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    /// Output of the last successfully executed non-coordinator block.
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<BlockLog>,
    pub metadata: ExecutionMetadata,
    /// Blocks ready to run next; populated by debug-mode passes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_blocks: Vec<String>,
}

/// A run that streamed output: the buffered stream plus the completed
/// execution record.
#[derive(Debug)]
pub struct StreamingExecution {
    pub stream: OutputStream,
    pub execution: ExecutionResult,
}

/// What `execute` hands back: a plain result, or a stream when at least
/// one selected block streamed.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Complete(ExecutionResult),
    Streaming(StreamingExecution),
}

impl ExecutionOutcome {
    /// The execution record regardless of form.
    pub fn execution(&self) -> &ExecutionResult {
        match self {
            ExecutionOutcome::Complete(result) => result,
            ExecutionOutcome::Streaming(streaming) => &streaming.execution,
        }
    }

    pub fn into_execution(self) -> ExecutionResult {
        match self {
            ExecutionOutcome::Complete(result) => result,
            ExecutionOutcome::Streaming(streaming) => streaming.execution,
        }
    }
}

/// Streaming request: which blocks may stream, and an optional callback
/// invoked per chunk alongside the buffered stream.
#[derive(Clone, Default)]
pub struct StreamingOptions {
    pub selected_outputs: HashSet<String>,
    pub on_stream: Option<OnStreamCallback>,
}

// ============================================================
// Builder
// ============================================================

pub struct ExecutorBuilder {
    workflow: SerializedWorkflow,
    config: ExecutorConfig,
    initial_block_states: HashMap<String, Value>,
    env_vars: HashMap<String, Value>,
    workflow_variables: HashMap<String, Value>,
    workflow_input: Value,
    streaming: Option<StreamingOptions>,
    provider: Option<Arc<dyn ProviderClient>>,
    workflow_source: Option<Arc<dyn WorkflowSource>>,
    events: Option<EventSender>,
    nesting_depth: usize,
}

impl ExecutorBuilder {
    fn new(workflow: SerializedWorkflow) -> Self {
        Self {
            workflow,
            config: ExecutorConfig::default(),
            initial_block_states: HashMap::new(),
            env_vars: HashMap::new(),
            workflow_variables: HashMap::new(),
            workflow_input: Value::Null,
            streaming: None,
            provider: None,
            workflow_source: None,
            events: None,
            nesting_depth: 0,
        }
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Pre-recorded outputs, keyed by block id. Seeded blocks count as
    /// executed, which lets tests and debug sessions start mid-graph.
    pub fn initial_block_states(mut self, states: HashMap<String, Value>) -> Self {
        self.initial_block_states = states;
        self
    }

    pub fn env_vars(mut self, vars: HashMap<String, Value>) -> Self {
        self.env_vars = vars;
        self
    }

    pub fn workflow_variables(mut self, vars: HashMap<String, Value>) -> Self {
        self.workflow_variables = vars;
        self
    }

    pub fn workflow_input(mut self, input: Value) -> Self {
        self.workflow_input = input;
        self
    }

    pub fn streaming(mut self, options: StreamingOptions) -> Self {
        self.streaming = Some(options);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn workflow_source(mut self, source: Arc<dyn WorkflowSource>) -> Self {
        self.workflow_source = Some(source);
        self
    }

    pub fn events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// Depth of this run below the root workflow; set by workflow blocks
    /// for their child runs.
    pub fn nesting_depth(mut self, depth: usize) -> Self {
        self.nesting_depth = depth;
        self
    }

    /// Validate the graph and produce a reusable executor.
    pub fn build(self) -> WorkflowResult<Executor> {
        validate_workflow(&self.workflow)?;
        Ok(Executor {
            workflow: self.workflow,
            config: self.config,
            registry: HandlerRegistry::new(),
            initial_block_states: self.initial_block_states,
            env_vars: self.env_vars,
            workflow_variables: self.workflow_variables,
            workflow_input: self.workflow_input,
            streaming: self.streaming,
            provider: self.provider,
            workflow_source: self.workflow_source,
            events: self.events,
            nesting_depth: self.nesting_depth,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        })
    }
}

// ============================================================
// Executor
// ============================================================

pub struct Executor {
    workflow: SerializedWorkflow,
    config: ExecutorConfig,
    registry: HandlerRegistry,
    initial_block_states: HashMap<String, Value>,
    env_vars: HashMap<String, Value>,
    workflow_variables: HashMap<String, Value>,
    workflow_input: Value,
    streaming: Option<StreamingOptions>,
    provider: Option<Arc<dyn ProviderClient>>,
    workflow_source: Option<Arc<dyn WorkflowSource>>,
    events: Option<EventSender>,
    nesting_depth: usize,
    cancel_flag: Arc<AtomicBool>,
}

/// One finished handler call, before its outcome is applied.
struct BlockExecution {
    result: Result<Value, BlockError>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    duration_ms: u64,
}

impl Executor {
    /// Executor with default options. Equivalent to `builder(..).build()`.
    pub fn new(workflow: SerializedWorkflow) -> WorkflowResult<Executor> {
        Self::builder(workflow).build()
    }

    pub fn builder(workflow: SerializedWorkflow) -> ExecutorBuilder {
        ExecutorBuilder::new(workflow)
    }

    pub fn workflow(&self) -> &SerializedWorkflow {
        &self.workflow
    }

    /// Handle that aborts this executor's runs, usable from another task.
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle::from_flag(self.cancel_flag.clone())
    }

    /// Run the workflow to completion.
    pub async fn execute(&self, workflow_id: &str) -> WorkflowResult<ExecutionOutcome> {
        let (ctx, stream) = self.prepare_context(workflow_id);
        tracing::info!(
            workflow = %workflow_id,
            execution = %ctx.execution_id(),
            blocks = self.workflow.blocks.len(),
            "starting workflow execution"
        );

        match self.run(&ctx).await {
            Ok(result) => {
                if result.success {
                    ctx.emit(ExecutionEvent::WorkflowCompleted {
                        execution_id: ctx.execution_id().to_string(),
                        output: result.output.clone(),
                        timestamp: Utc::now(),
                    });
                } else {
                    ctx.emit(ExecutionEvent::WorkflowFailed {
                        execution_id: ctx.execution_id().to_string(),
                        error: result.error.clone().unwrap_or_default(),
                        timestamp: Utc::now(),
                    });
                }
                if ctx.did_stream() {
                    ctx.end_stream();
                    if let Some(stream) = stream {
                        return Ok(ExecutionOutcome::Streaming(StreamingExecution {
                            stream,
                            execution: result,
                        }));
                    }
                }
                Ok(ExecutionOutcome::Complete(result))
            }
            Err(err) => {
                ctx.emit(ExecutionEvent::WorkflowFailed {
                    execution_id: ctx.execution_id().to_string(),
                    error: err.to_string(),
                    timestamp: Utc::now(),
                });
                ctx.end_stream();
                Err(err)
            }
        }
    }

    /// Context primed with this executor's inputs, for debug sessions
    /// driving [`continue_execution`](Executor::continue_execution).
    pub fn create_context(&self, workflow_id: &str) -> ExecutionContext {
        self.prepare_context(workflow_id).0
    }

    /// Execute exactly the named blocks once against an existing context
    /// and report the blocks that became ready. Dependency gating is the
    /// caller's responsibility.
    pub async fn continue_execution(
        &self,
        block_ids: &[String],
        ctx: &ExecutionContext,
    ) -> WorkflowResult<ExecutionResult> {
        let start = Instant::now();
        let resolver = Resolver::new(&self.workflow);
        let path = PathTracker::new(&self.workflow);

        let mut refs = Vec::with_capacity(block_ids.len());
        for id in block_ids {
            if self.workflow.block(id).is_none() {
                return Err(WorkflowError::BlockNotFound(id.clone()));
            }
            refs.push(BlockRef::real(id.as_str()));
        }
        for _ in &refs {
            if ctx.increment_steps() > self.config.max_steps {
                return Err(WorkflowError::MaxStepsExceeded(self.config.max_steps));
            }
        }
        let executions = join_all(
            refs.iter()
                .map(|block_ref| self.execute_block(block_ref, ctx, &resolver)),
        )
        .await;

        let mut fatal: Option<(String, String)> = None;
        for (block_ref, execution) in refs.iter().zip(executions) {
            if let Some(failure) = self.apply_outcome(block_ref, execution, ctx, &path) {
                fatal.get_or_insert(failure);
            }
        }

        let mut result = match fatal {
            Some((block_id, error)) => {
                let message = format!("block \"{block_id}\" failed: {error}");
                self.finalize(ctx, start, false, Some(message))
            }
            None => self.finalize(ctx, start, true, None),
        };
        result.pending_blocks = self
            .collect_ready(ctx)
            .iter()
            .map(|r| r.to_string())
            .collect();
        Ok(result)
    }

    // ============================================================
    // Run loop
    // ============================================================

    fn prepare_context(&self, workflow_id: &str) -> (ExecutionContext, Option<OutputStream>) {
        let mut ctx = ExecutionContext::new(workflow_id)
            .with_environment(self.env_vars.clone())
            .with_workflow_variables(self.workflow_variables.clone())
            .with_workflow_input(self.workflow_input.clone())
            .with_nesting_depth(self.nesting_depth)
            .with_cancellation(self.cancel_flag.clone());
        if let Some(sender) = &self.events {
            ctx = ctx.with_events(sender.clone());
        }
        let mut stream = None;
        if let Some(options) = &self.streaming {
            let (output, writer) = channel();
            ctx = ctx.with_streaming(StreamingContext {
                selected_outputs: options.selected_outputs.clone(),
                writer,
                on_stream: options.on_stream.clone(),
            });
            stream = Some(output);
        }

        let path = PathTracker::new(&self.workflow);
        for (block_id, output) in &self.initial_block_states {
            ctx.seed_block_state(block_id, output.clone());
            path.activate_on_success(block_id, &ctx);
        }
        (ctx, stream)
    }

    async fn run(&self, ctx: &ExecutionContext) -> WorkflowResult<ExecutionResult> {
        let start = Instant::now();
        let resolver = Resolver::new(&self.workflow);
        let path = PathTracker::new(&self.workflow);

        let entry = self
            .workflow
            .entry_block()
            .ok_or_else(|| WorkflowError::InvalidWorkflow("no entry block".to_string()))?;
        ctx.add_to_path(&entry.id);

        loop {
            if ctx.is_cancelled() {
                tracing::info!(execution = %ctx.execution_id(), "execution cancelled");
                return Err(WorkflowError::Cancelled);
            }
            if start.elapsed().as_secs() > self.config.max_execution_time_secs {
                return Err(WorkflowError::ExecutionTimeout);
            }

            let ready = self.collect_ready(ctx);
            if ready.is_empty() {
                break;
            }
            for _ in &ready {
                if ctx.increment_steps() > self.config.max_steps {
                    return Err(WorkflowError::MaxStepsExceeded(self.config.max_steps));
                }
            }

            let executed_before = ctx.executed_len();
            let completed_before = ctx.completed_subflows_len();
            let regions_before = self.region_progress_marker(ctx);

            let executions = join_all(
                ready
                    .iter()
                    .map(|block_ref| self.execute_block(block_ref, ctx, &resolver)),
            )
            .await;

            let mut fatal: Option<(String, String)> = None;
            for (block_ref, execution) in ready.iter().zip(executions) {
                if let Some(failure) = self.apply_outcome(block_ref, execution, ctx, &path) {
                    fatal.get_or_insert(failure);
                }
            }
            if let Some((block_id, error)) = fatal {
                tracing::warn!(block = %block_id, error = %error, "workflow run failed");
                let message = format!("block \"{block_id}\" failed: {error}");
                return Ok(self.finalize(ctx, start, false, Some(message)));
            }

            if self.config.debug {
                let mut result = self.finalize(ctx, start, true, None);
                result.pending_blocks = self
                    .collect_ready(ctx)
                    .iter()
                    .map(|r| r.to_string())
                    .collect();
                return Ok(result);
            }

            let progressed = ctx.executed_len() > executed_before
                || ctx.completed_subflows_len() > completed_before
                || self.region_progress_marker(ctx) > regions_before;
            if !progressed {
                tracing::warn!(
                    execution = %ctx.execution_id(),
                    "scheduling pass made no progress, ending run"
                );
                break;
            }
        }

        Ok(self.finalize(ctx, start, true, None))
    }

    /// Real blocks whose dependencies are met, plus runnable virtual
    /// instances of every active region.
    fn collect_ready(&self, ctx: &ExecutionContext) -> Vec<BlockRef> {
        let mut ready = Vec::new();
        for block in &self.workflow.blocks {
            if !block.enabled {
                continue;
            }
            // Body blocks only run as virtual instances.
            if self.workflow.containing_loop(&block.id).is_some()
                || self.workflow.containing_parallel(&block.id).is_some()
            {
                continue;
            }
            let block_ref = BlockRef::real(&block.id);
            if ctx.is_executed(&block_ref) || !ctx.is_in_path(&block.id) {
                continue;
            }
            if self.dependencies_met(block, ctx) {
                ready.push(block_ref);
            }
        }
        for descriptor in self.workflow.loops.values() {
            if ctx.is_subflow_completed(&descriptor.id) {
                continue;
            }
            ready.extend(LoopManager::new(&self.workflow, descriptor).schedulable_instances(ctx));
        }
        for descriptor in self.workflow.parallels.values() {
            if ctx.is_subflow_completed(&descriptor.id) {
                continue;
            }
            ready.extend(
                ParallelManager::new(&self.workflow, descriptor).schedulable_instances(ctx),
            );
        }
        ready
    }

    /// Per-edge dependency check for a real block already on the active
    /// path. An edge whose source sits outside the path belongs to an
    /// unchosen branch and never blocks; an edge from an executed decider
    /// is settled either way because path activation did the pruning.
    fn dependencies_met(&self, block: &SerializedBlock, ctx: &ExecutionContext) -> bool {
        for conn in self.workflow.incoming(&block.id) {
            let source_ref = BlockRef::real(&conn.source);
            let source_kind = self
                .workflow
                .block(&conn.source)
                .map(|b| b.kind())
                .unwrap_or(BlockKind::Unknown);
            let dead = !ctx.is_in_path(&conn.source);

            let satisfied = if conn.source_handle.is_subflow_end() {
                ctx.is_subflow_completed(&conn.source) || dead
            } else if conn.source_handle.is_subflow_start() {
                // Start edges feed region bodies, not real scheduling.
                true
            } else if conn.source_handle.is_error()
                || matches!(
                    conn.source_handle,
                    ConnectionHandle::ConditionTrue | ConnectionHandle::ConditionFalse
                )
                || source_kind == BlockKind::Router
            {
                ctx.is_executed(&source_ref) || dead
            } else {
                // Plain edge: needs a successful source. A failed source
                // satisfies only its error edges.
                if ctx.is_executed(&source_ref) {
                    !ctx.output_has_error(&source_ref)
                } else {
                    dead
                }
            };
            if !satisfied {
                return false;
            }
        }
        true
    }

    async fn execute_block(
        &self,
        block_ref: &BlockRef,
        ctx: &ExecutionContext,
        resolver: &Resolver<'_>,
    ) -> BlockExecution {
        let started_at = Utc::now();
        let timer = Instant::now();
        let node_id = block_ref.node_id();

        let result = match self.workflow.block(node_id) {
            Some(block) => {
                ctx.emit(ExecutionEvent::BlockStarted {
                    block_id: block_ref.to_string(),
                    block_type: block.kind().as_str().to_string(),
                    timestamp: started_at,
                });
                tracing::debug!(block = %block_ref, kind = %block.kind(), "executing block");
                self.run_handler(block, block_ref, ctx, resolver).await
            }
            None => Err(BlockError::Execution(format!(
                "block \"{node_id}\" not found in workflow"
            ))),
        };

        BlockExecution {
            result,
            started_at,
            ended_at: Utc::now(),
            duration_ms: timer.elapsed().as_millis() as u64,
        }
    }

    async fn run_handler(
        &self,
        block: &SerializedBlock,
        block_ref: &BlockRef,
        ctx: &ExecutionContext,
        resolver: &Resolver<'_>,
    ) -> Result<Value, BlockError> {
        let inputs = resolver.resolve_inputs(block, ctx, block_ref)?;
        let handler = self.registry.for_block(block).ok_or_else(|| {
            BlockError::Execution(format!("no handler for block kind \"{}\"", block.kind()))
        })?;
        let scope = ExecutionScope {
            block_ref,
            workflow: &self.workflow,
            resolver,
            provider: self.provider.clone(),
            workflow_source: self.workflow_source.clone(),
            config: &self.config,
            streaming_eligible: ctx.stream_selected(&block.id),
        };

        // Sub-workflows carry their own run-level time bound.
        if block.kind() == BlockKind::Workflow {
            return handler.execute(block, &inputs, ctx, &scope).await;
        }
        let timeout = Duration::from_secs(self.config.block_timeout_secs);
        match tokio::time::timeout(timeout, handler.execute(block, &inputs, ctx, &scope)).await {
            Ok(result) => result,
            Err(_) => Err(BlockError::Timeout(self.config.block_timeout_secs)),
        }
    }

    /// Record one execution's outcome and update the path. Returns the
    /// failure that should end the run, if any.
    fn apply_outcome(
        &self,
        block_ref: &BlockRef,
        execution: BlockExecution,
        ctx: &ExecutionContext,
        path: &PathTracker<'_>,
    ) -> Option<(String, String)> {
        let node_id = block_ref.node_id();
        let Some(block) = self.workflow.block(node_id) else {
            return Some((node_id.to_string(), "unknown block".to_string()));
        };

        match execution.result {
            Ok(ref output) => {
                if block.kind().is_subflow() && !block_ref.is_virtual() {
                    // Coordinators stay unexecuted until their region
                    // aggregates, so later passes re-invoke them.
                    if ctx.is_subflow_completed(node_id) {
                        ctx.record_output(block_ref, output.clone(), execution.duration_ms);
                        self.log_block(block_ref, block, &execution, true, None, output.clone(), ctx);
                        path.activate_subflow_end(node_id, ctx);
                    } else {
                        tracing::trace!(block = %node_id, "region still in progress");
                    }
                    return None;
                }

                ctx.record_output(block_ref, output.clone(), execution.duration_ms);
                ctx.set_last_output(output.clone());
                match block.kind() {
                    BlockKind::Router => {
                        if let Some(target) = ctx.router_decision(block_ref) {
                            ctx.emit(ExecutionEvent::BranchSelected {
                                block_id: block_ref.to_string(),
                                target,
                                timestamp: execution.ended_at,
                            });
                        }
                    }
                    BlockKind::Condition => {
                        if let Some(decision) = ctx.condition_decision(block_ref) {
                            ctx.emit(ExecutionEvent::BranchSelected {
                                block_id: block_ref.to_string(),
                                target: decision.to_string(),
                                timestamp: execution.ended_at,
                            });
                        }
                    }
                    _ => {}
                }
                self.log_block(block_ref, block, &execution, true, None, output.clone(), ctx);
                if !block_ref.is_virtual() {
                    path.activate_on_success(node_id, ctx);
                }
                None
            }
            Err(ref error) => {
                let message = error.to_string();
                ctx.record_output(
                    block_ref,
                    json!({"error": message}),
                    execution.duration_ms,
                );
                self.log_block(
                    block_ref,
                    block,
                    &execution,
                    false,
                    Some(message.clone()),
                    Value::Null,
                    ctx,
                );
                if block_ref.is_virtual() {
                    // Instance failures are judged by the region manager:
                    // either an error edge inside the region absorbs them
                    // or the coordinator reports the region failed.
                    return None;
                }

                // Entry and branching blocks have no error path: without a
                // valid decision the graph cannot continue.
                let unroutable = block.is_entry() || block.kind().makes_decisions();
                let routed = !unroutable && path.activate_on_failure(node_id, ctx);
                if routed {
                    tracing::debug!(block = %node_id, error = %message, "error routed");
                    None
                } else {
                    Some((node_id.to_string(), message))
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_block(
        &self,
        block_ref: &BlockRef,
        block: &SerializedBlock,
        execution: &BlockExecution,
        success: bool,
        error: Option<String>,
        output: Value,
        ctx: &ExecutionContext,
    ) {
        if success {
            ctx.emit(ExecutionEvent::BlockCompleted {
                block_id: block_ref.to_string(),
                output: output.clone(),
                duration_ms: execution.duration_ms,
                timestamp: execution.ended_at,
            });
        } else {
            ctx.emit(ExecutionEvent::BlockFailed {
                block_id: block_ref.to_string(),
                error: error.clone().unwrap_or_default(),
                timestamp: execution.ended_at,
            });
        }
        ctx.push_log(BlockLog {
            block_id: block_ref.to_string(),
            block_name: block.name().to_string(),
            block_type: block.kind().as_str().to_string(),
            started_at: execution.started_at,
            ended_at: execution.ended_at,
            duration_ms: execution.duration_ms,
            success,
            error,
            output,
        });
    }

    /// Monotonic marker of loop/parallel internal progress, so passes
    /// that only advance a region (without executing or completing
    /// anything) still count as progress.
    fn region_progress_marker(&self, ctx: &ExecutionContext) -> usize {
        let mut marker = 0;
        for id in self.workflow.loops.keys() {
            if let Some(state) = ctx.loop_state(id) {
                marker += 1 + state.current_iteration + state.results.len();
            }
        }
        for id in self.workflow.parallels.keys() {
            if let Some(state) = ctx.parallel_state(id) {
                marker += 1 + state.completed_executions + state.execution_results.len();
            }
        }
        marker
    }

    fn finalize(
        &self,
        ctx: &ExecutionContext,
        start: Instant,
        success: bool,
        error: Option<String>,
    ) -> ExecutionResult {
        let output = if success {
            ctx.last_output()
        } else {
            json!({"error": error.clone().unwrap_or_default()})
        };
        tracing::info!(
            execution = %ctx.execution_id(),
            success,
            steps = ctx.steps(),
            "workflow execution finished"
        );
        ExecutionResult {
            success,
            output,
            error,
            logs: ctx.logs_snapshot(),
            metadata: ExecutionMetadata {
                duration_ms: start.elapsed().as_millis() as u64,
                start_time: ctx.started_at(),
                end_time: Utc::now(),
            },
            pending_blocks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_workflow() -> SerializedWorkflow {
        SerializedWorkflow::from_json(
            &serde_json::to_string(&json!({
                "version": "1.0",
                "blocks": [
                    {"id": "start", "metadata": {"id": "starter", "name": "Start"}},
                    {"id": "calc", "metadata": {"id": "function", "name": "Calc"},
                     "config": {"params": {"code": "2 + 3"}}},
                    {"id": "respond", "metadata": {"id": "response", "name": "Respond"},
                     "config": {"params": {"data": "<calc.result>"}}}
                ],
                "connections": [
                    {"source": "start", "target": "calc"},
                    {"source": "calc", "target": "respond"}
                ]
            }))
            .unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_linear_run_completes() {
        let executor = Executor::builder(linear_workflow()).build().unwrap();
        let result = executor.execute("wf").await.unwrap().into_execution();
        assert!(result.success);
        assert_eq!(result.output["data"], json!(5));
        assert_eq!(result.output["status"], json!(200));
        // starter, calc, respond
        assert_eq!(result.logs.len(), 3);
        assert!(result.logs.iter().all(|l| l.success));
    }

    #[tokio::test]
    async fn test_disabled_block_is_skipped() {
        let mut workflow = linear_workflow();
        workflow
            .blocks
            .iter_mut()
            .find(|b| b.id == "respond")
            .unwrap()
            .enabled = false;
        let executor = Executor::builder(workflow).build().unwrap();
        let result = executor.execute("wf").await.unwrap().into_execution();
        assert!(result.success);
        // The run ends at calc; its output is the final one.
        assert_eq!(result.output["result"], json!(5));
        assert_eq!(result.logs.len(), 2);
    }

    #[tokio::test]
    async fn test_max_steps_exceeded() {
        let executor = Executor::builder(linear_workflow())
            .config(ExecutorConfig {
                max_steps: 1,
                ..ExecutorConfig::default()
            })
            .build()
            .unwrap();
        let err = executor.execute("wf").await.unwrap_err();
        assert!(matches!(err, WorkflowError::MaxStepsExceeded(1)));
    }

    #[tokio::test]
    async fn test_cancellation_before_first_pass() {
        let executor = Executor::builder(linear_workflow()).build().unwrap();
        executor.cancellation_handle().cancel();
        let err = executor.execute("wf").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));
    }

    #[tokio::test]
    async fn test_debug_mode_stops_after_one_pass() {
        let executor = Executor::builder(linear_workflow())
            .config(ExecutorConfig {
                debug: true,
                ..ExecutorConfig::default()
            })
            .build()
            .unwrap();
        let result = executor.execute("wf").await.unwrap().into_execution();
        assert!(result.success);
        // Only the starter ran; calc is next.
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.pending_blocks, vec!["calc".to_string()]);
    }

    #[tokio::test]
    async fn test_continue_execution_runs_named_blocks() {
        let executor = Executor::builder(linear_workflow())
            .config(ExecutorConfig {
                debug: true,
                ..ExecutorConfig::default()
            })
            .build()
            .unwrap();
        let ctx = executor.create_context("wf");
        ctx.add_to_path("start");
        let first = executor
            .continue_execution(&["start".to_string()], &ctx)
            .await
            .unwrap();
        assert!(first.success);
        assert_eq!(first.pending_blocks, vec!["calc".to_string()]);

        let second = executor
            .continue_execution(&["calc".to_string()], &ctx)
            .await
            .unwrap();
        assert!(second.success);
        assert_eq!(second.output["result"], json!(5));
        assert_eq!(second.pending_blocks, vec!["respond".to_string()]);
    }

    #[tokio::test]
    async fn test_seeded_states_skip_upstream_blocks() {
        let executor = Executor::builder(linear_workflow())
            .initial_block_states(HashMap::from([
                ("start".to_string(), json!({"input": {}})),
                ("calc".to_string(), json!({"result": 42})),
            ]))
            .build()
            .unwrap();
        let result = executor.execute("wf").await.unwrap().into_execution();
        assert!(result.success);
        // Only respond actually executes, consuming the seeded output.
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.output["data"], json!(42));
    }
}
