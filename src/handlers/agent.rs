//! Agent block handler.
//!
//! Turns block params into a provider request and shapes the response
//! into the block's output. When the run streams and this block was
//! selected for live output, deltas are forwarded to the output stream
//! as they arrive while the full response is still collected for
//! downstream references.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::provider::{ProviderChunk, ProviderRequest, ProviderResponse};
use crate::workflow::schema::{BlockKind, SerializedBlock};

pub struct AgentHandler;

fn build_request(inputs: &Value, stream: bool) -> ProviderRequest {
    let string_of = |key: &str| inputs.get(key).and_then(Value::as_str).map(String::from);
    // responseFormat arrives either as a JSON object or as its string form.
    let response_format = match inputs.get("responseFormat") {
        Some(Value::String(s)) if !s.trim().is_empty() => serde_json::from_str(s).ok(),
        Some(Value::Null) | Some(Value::String(_)) | None => None,
        Some(other) => Some(other.clone()),
    };
    ProviderRequest {
        provider: string_of("provider").unwrap_or_else(|| "openai".to_string()),
        model: string_of("model").unwrap_or_default(),
        system_prompt: string_of("systemPrompt"),
        context: inputs
            .get("context")
            .or_else(|| inputs.get("userPrompt"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        tools: inputs
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        temperature: inputs.get("temperature").and_then(Value::as_f64),
        max_tokens: inputs.get("maxTokens").and_then(Value::as_u64),
        api_key: string_of("apiKey"),
        response_format,
        stream,
    }
}

fn shape_output(response: ProviderResponse) -> Value {
    let mut output = Map::new();
    output.insert("content".to_string(), Value::String(response.content));
    output.insert("model".to_string(), Value::String(response.model));
    output.insert(
        "tokens".to_string(),
        json!({
            "prompt": response.tokens.prompt,
            "completion": response.tokens.completion,
            "total": response.tokens.total,
        }),
    );
    if !response.tool_calls.is_empty() {
        output.insert(
            "toolCalls".to_string(),
            serde_json::to_value(&response.tool_calls).unwrap_or(Value::Null),
        );
    }
    if let Some(cost) = response.cost {
        if let Some(number) = serde_json::Number::from_f64(cost) {
            output.insert("cost".to_string(), Value::Number(number));
        }
    }
    output.insert("durationMs".to_string(), json!(response.time_ms));
    Value::Object(output)
}

#[async_trait]
impl BlockHandler for AgentHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Agent]
    }

    async fn execute(
        &self,
        _block: &SerializedBlock,
        inputs: &Value,
        ctx: &ExecutionContext,
        scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        let client = scope.provider()?;

        if scope.streaming_eligible {
            let (tx, mut rx) = mpsc::channel::<ProviderChunk>(32);
            let block_id = scope.block_ref.to_string();
            let forward = async {
                while let Some(chunk) = rx.recv().await {
                    if !chunk.delta.is_empty() {
                        ctx.write_chunk(&block_id, &chunk.delta);
                    }
                }
            };
            let request = build_request(inputs, true);
            let (result, ()) = tokio::join!(client.execute_stream(request, tx), forward);
            return Ok(shape_output(result?));
        }

        let response = client.execute(build_request(inputs, false)).await?;
        Ok(shape_output(response))
    }
}
