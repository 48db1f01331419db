//! Pass-through handler for generic blocks and kinds with no dedicated
//! logic. The resolved params become the output unchanged, which keeps
//! unrecognized block types from breaking a run.

use async_trait::async_trait;
use serde_json::Value;

use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::workflow::schema::{BlockKind, SerializedBlock};

pub struct GenericHandler;

#[async_trait]
impl BlockHandler for GenericHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Generic, BlockKind::Unknown]
    }

    async fn execute(
        &self,
        block: &SerializedBlock,
        inputs: &Value,
        _ctx: &ExecutionContext,
        _scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        if block.kind() == BlockKind::Unknown {
            tracing::debug!(block_id = %block.id, "no dedicated handler; passing inputs through");
        }
        Ok(inputs.clone())
    }
}
