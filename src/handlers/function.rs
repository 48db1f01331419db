//! Function block handler.
//!
//! Runs the block's `code` (or `expression`) param through the restricted
//! expression evaluator. References were already substituted as quoted
//! literals by the resolver, so the text reaching this handler is
//! self-contained.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::expression;
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::workflow::schema::{BlockKind, SerializedBlock};

pub struct FunctionHandler;

#[async_trait]
impl BlockHandler for FunctionHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Function]
    }

    async fn execute(
        &self,
        _block: &SerializedBlock,
        inputs: &Value,
        _ctx: &ExecutionContext,
        _scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        let code = inputs
            .get("code")
            .or_else(|| inputs.get("expression"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BlockError::InvalidParams(
                    "function block requires a string `code` or `expression` param".to_string(),
                )
            })?;
        let result = expression::evaluate(code)?;
        Ok(json!({"result": result, "stdout": ""}))
    }
}
