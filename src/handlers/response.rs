//! Response block handler: shapes the run's outward-facing payload.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::workflow::schema::{BlockKind, SerializedBlock};

pub struct ResponseHandler;

#[async_trait]
impl BlockHandler for ResponseHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Response]
    }

    async fn execute(
        &self,
        _block: &SerializedBlock,
        inputs: &Value,
        _ctx: &ExecutionContext,
        _scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        // Without an explicit `data` param the whole resolved param set
        // becomes the payload.
        let data = inputs
            .get("data")
            .cloned()
            .unwrap_or_else(|| inputs.clone());
        let status = inputs
            .get("status")
            .and_then(Value::as_u64)
            .unwrap_or(200);
        let headers = inputs
            .get("headers")
            .cloned()
            .unwrap_or_else(|| json!({}));
        Ok(json!({"data": data, "status": status, "headers": headers}))
    }
}
