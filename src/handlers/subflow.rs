//! Loop and parallel coordinator handlers.
//!
//! A coordinator block does not run its body itself: the scheduler asks
//! the region manager which instances are runnable and executes them as
//! virtual blocks. The handler's job on each invocation is to make sure
//! the region state exists and to report where the region stands. Until
//! the region finishes, the coordinator stays unexecuted and gets
//! invoked again on later passes; on completion it marks the region done
//! and its aggregated results become the block's output.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::context::ExecutionContext;
use crate::core::loop_manager::{LoopManager, LoopPhase};
use crate::core::parallel_manager::{ParallelManager, ParallelPhase};
use crate::error::BlockError;
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::workflow::schema::{BlockKind, SerializedBlock};

pub struct LoopBlockHandler;

#[async_trait]
impl BlockHandler for LoopBlockHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Loop]
    }

    async fn execute(
        &self,
        block: &SerializedBlock,
        _inputs: &Value,
        ctx: &ExecutionContext,
        scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        let descriptor = scope.workflow.loops.get(&block.id).ok_or_else(|| {
            BlockError::InvalidParams(format!("no loop descriptor for block \"{}\"", block.id))
        })?;
        let manager = LoopManager::new(scope.workflow, descriptor);
        if !manager.ensure_initialized(scope.resolver, ctx) {
            return Ok(json!({"status": "waiting"}));
        }
        match manager.poll(ctx) {
            LoopPhase::Complete { results } => {
                ctx.complete_subflow(&block.id);
                Ok(json!({"completed": true, "results": results}))
            }
            LoopPhase::Iterating { iteration } => {
                Ok(json!({"status": "iterating", "iteration": iteration}))
            }
            LoopPhase::Unavailable => Ok(json!({"status": "waiting"})),
            LoopPhase::Failed { iteration, error } => Err(BlockError::Execution(format!(
                "loop \"{}\" iteration {iteration} failed: {error}",
                block.id
            ))),
        }
    }
}

pub struct ParallelBlockHandler;

#[async_trait]
impl BlockHandler for ParallelBlockHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Parallel]
    }

    async fn execute(
        &self,
        block: &SerializedBlock,
        _inputs: &Value,
        ctx: &ExecutionContext,
        scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        let descriptor = scope.workflow.parallels.get(&block.id).ok_or_else(|| {
            BlockError::InvalidParams(format!("no parallel descriptor for block \"{}\"", block.id))
        })?;
        let manager = ParallelManager::new(scope.workflow, descriptor);
        if !manager.ensure_initialized(scope.resolver, ctx) {
            return Ok(json!({"status": "waiting"}));
        }
        match manager.poll(ctx) {
            ParallelPhase::Complete { results } => {
                ctx.complete_subflow(&block.id);
                Ok(json!({"completed": true, "results": results}))
            }
            ParallelPhase::Waiting { completed, total } => {
                Ok(json!({"status": "running", "completed": completed, "total": total}))
            }
            ParallelPhase::Unavailable => Ok(json!({"status": "waiting"})),
            ParallelPhase::Failed { iteration, error } => Err(BlockError::Execution(format!(
                "parallel \"{}\" branch {iteration} failed: {error}",
                block.id
            ))),
        }
    }
}
