//! Entry-point handler: starter blocks, webhook/schedule triggers, and
//! any block running in trigger mode.
//!
//! Entry blocks run no logic of their own. They surface the run's input
//! under `input` and spread its top-level object fields for direct
//! reference, so `<start.input>` and `<start.city>` both resolve.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::workflow::schema::{BlockKind, SerializedBlock};

pub struct TriggerHandler;

#[async_trait]
impl BlockHandler for TriggerHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Starter, BlockKind::Webhook, BlockKind::Schedule]
    }

    async fn execute(
        &self,
        _block: &SerializedBlock,
        _inputs: &Value,
        ctx: &ExecutionContext,
        _scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        let input = ctx.workflow_input().clone();
        let mut output = Map::new();
        if let Value::Object(fields) = &input {
            for (key, value) in fields {
                if key != "input" {
                    output.insert(key.clone(), value.clone());
                }
            }
        }
        output.insert("input".to_string(), input);
        Ok(Value::Object(output))
    }
}
