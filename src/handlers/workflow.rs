//! Workflow block handler.
//!
//! Runs another workflow inline: the referenced graph is loaded through
//! a [`WorkflowSource`], executed with a child engine that inherits the
//! parent's environment and backends, and the child's final output
//! becomes this block's output. Nesting is depth-limited so mutually
//! referencing workflows cannot recurse forever.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::executor::{ExecutionOutcome, Executor};
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::workflow::schema::{BlockKind, SerializedBlock, SerializedWorkflow};

/// Deepest allowed chain of workflow blocks. The root run is depth 0.
pub const MAX_WORKFLOW_NESTING: usize = 10;

/// Where workflow blocks fetch the graphs they reference.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn load(&self, workflow_id: &str) -> Result<SerializedWorkflow, BlockError>;
}

pub struct WorkflowHandler;

#[async_trait]
impl BlockHandler for WorkflowHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Workflow]
    }

    async fn execute(
        &self,
        block: &SerializedBlock,
        inputs: &Value,
        ctx: &ExecutionContext,
        scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        let workflow_id = inputs
            .get("workflowId")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                BlockError::InvalidParams(format!(
                    "workflow block \"{}\" references no workflow",
                    block.id
                ))
            })?;
        if ctx.nesting_depth() >= MAX_WORKFLOW_NESTING {
            return Err(BlockError::Execution(format!(
                "workflow nesting exceeds {MAX_WORKFLOW_NESTING} levels at \"{workflow_id}\""
            )));
        }
        let source = scope
            .workflow_source
            .clone()
            .ok_or(BlockError::MissingWorkflowSource)?;

        let child = source.load(workflow_id).await?;
        let child_input = inputs.get("input").cloned().unwrap_or(Value::Null);
        tracing::debug!(
            parent = %ctx.workflow_id(),
            child = %workflow_id,
            depth = ctx.nesting_depth() + 1,
            "starting sub-workflow"
        );

        let mut builder = Executor::builder(child)
            .env_vars(ctx.environment_variables().clone())
            .workflow_input(child_input)
            .config(scope.config.clone())
            .nesting_depth(ctx.nesting_depth() + 1)
            .workflow_source(source.clone());
        if let Some(provider) = scope.provider.clone() {
            builder = builder.provider(provider);
        }
        let executor = builder
            .build()
            .map_err(|e| BlockError::Execution(format!("sub-workflow \"{workflow_id}\": {e}")))?;

        // The child future contains this handler again; box it to keep the
        // recursive future finite.
        let outcome = Box::pin(executor.execute(workflow_id))
            .await
            .map_err(|e| BlockError::Execution(format!("sub-workflow \"{workflow_id}\": {e}")))?;
        let result = match outcome {
            ExecutionOutcome::Complete(result) => result,
            ExecutionOutcome::Streaming(streaming) => streaming.execution,
        };

        if !result.success {
            return Err(BlockError::Execution(format!(
                "sub-workflow \"{workflow_id}\" failed: {}",
                result.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        Ok(json!({
            "success": true,
            "childWorkflowName": workflow_id,
            "result": result.output,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::core::block_ref::BlockRef;
    use crate::resolver::Resolver;

    fn workflow() -> SerializedWorkflow {
        SerializedWorkflow::from_json(
            &serde_json::to_string(&json!({
                "version": "1.0",
                "blocks": [{"id": "sub", "metadata": {"id": "workflow", "name": "Child"}}],
                "connections": []
            }))
            .unwrap(),
        )
        .unwrap()
    }

    async fn run(inputs: Value, ctx: ExecutionContext) -> Result<Value, BlockError> {
        let workflow = workflow();
        let resolver = Resolver::new(&workflow);
        let config = ExecutorConfig::default();
        let block_ref = BlockRef::real("sub");
        let scope = ExecutionScope {
            block_ref: &block_ref,
            workflow: &workflow,
            resolver: &resolver,
            provider: None,
            workflow_source: None,
            config: &config,
            streaming_eligible: false,
        };
        let block = workflow.block("sub").unwrap().clone();
        WorkflowHandler.execute(&block, &inputs, &ctx, &scope).await
    }

    #[tokio::test]
    async fn test_missing_reference_is_invalid() {
        let err = run(json!({}), ExecutionContext::new("wf")).await.unwrap_err();
        assert!(matches!(err, BlockError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_missing_source_is_reported() {
        let err = run(json!({"workflowId": "child"}), ExecutionContext::new("wf"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::MissingWorkflowSource));
    }

    #[tokio::test]
    async fn test_nesting_limit_is_enforced() {
        let ctx = ExecutionContext::new("wf").with_nesting_depth(MAX_WORKFLOW_NESTING);
        let err = run(json!({"workflowId": "child"}), ctx).await.unwrap_err();
        assert!(err.to_string().contains("nesting"));
    }
}
