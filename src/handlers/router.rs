//! Router block handler.
//!
//! Asks the provider to pick one of the block's outgoing targets and
//! records the choice as this instance's decision. Only the chosen
//! target joins the active path. A response naming no known target is an
//! error, and router failures are fatal to the run rather than routable.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::provider::ProviderRequest;
use crate::resolver::block_alias;
use crate::workflow::schema::{BlockKind, ConnectionHandle, SerializedBlock, SerializedWorkflow};

pub struct RouterHandler;

struct Candidate {
    id: String,
    name: String,
    kind: BlockKind,
}

fn candidates(workflow: &SerializedWorkflow, block_id: &str) -> Vec<Candidate> {
    workflow
        .outgoing(block_id)
        .filter(|c| c.source_handle == ConnectionHandle::Source)
        .filter_map(|c| workflow.block(&c.target))
        .map(|b| Candidate {
            id: b.id.clone(),
            name: b.name().to_string(),
            kind: b.kind(),
        })
        .collect()
}

fn routing_prompt(candidates: &[Candidate]) -> String {
    let mut prompt = String::from(
        "You are a routing module inside a workflow. Choose exactly one \
         destination block for the given input and respond with only that \
         block's id, nothing else.\nDestinations:\n",
    );
    for candidate in candidates {
        prompt.push_str(&format!(
            "- id: {} (name: {}, type: {})\n",
            candidate.id, candidate.name, candidate.kind
        ));
    }
    prompt
}

/// Match the model's reply to a target id: exact id, then id/alias with
/// quotes stripped, then the first id mentioned anywhere in the text.
fn parse_decision(content: &str, candidates: &[Candidate]) -> Option<String> {
    let trimmed = content.trim().trim_matches(['"', '\'', '`']);
    for candidate in candidates {
        if trimmed == candidate.id {
            return Some(candidate.id.clone());
        }
    }
    let lowered = trimmed.to_lowercase();
    for candidate in candidates {
        if lowered == candidate.id.to_lowercase() || lowered == block_alias(&candidate.name) {
            return Some(candidate.id.clone());
        }
    }
    for candidate in candidates {
        if content.contains(&candidate.id) {
            return Some(candidate.id.clone());
        }
    }
    None
}

#[async_trait]
impl BlockHandler for RouterHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Router]
    }

    async fn execute(
        &self,
        block: &SerializedBlock,
        inputs: &Value,
        ctx: &ExecutionContext,
        scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        let targets = candidates(scope.workflow, &block.id);
        if targets.is_empty() {
            return Err(BlockError::Execution(format!(
                "router \"{}\" has no outgoing targets to choose from",
                block.id
            )));
        }

        let request = ProviderRequest {
            provider: inputs
                .get("provider")
                .and_then(Value::as_str)
                .unwrap_or("openai")
                .to_string(),
            model: inputs
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            system_prompt: Some(routing_prompt(&targets)),
            context: inputs
                .get("prompt")
                .or_else(|| inputs.get("context"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            temperature: inputs.get("temperature").and_then(Value::as_f64),
            api_key: inputs
                .get("apiKey")
                .and_then(Value::as_str)
                .map(String::from),
            ..ProviderRequest::default()
        };

        let response = scope.provider()?.execute(request).await?;
        let chosen = parse_decision(&response.content, &targets).ok_or_else(|| {
            BlockError::Execution(format!(
                "router \"{}\" chose \"{}\", which matches none of its targets",
                block.id,
                response.content.trim()
            ))
        })?;

        ctx.set_router_decision(scope.block_ref, &chosen);
        let target = targets
            .iter()
            .find(|c| c.id == chosen)
            .map(|c| {
                json!({
                    "blockId": c.id,
                    "blockType": c.kind.as_str(),
                    "blockTitle": c.name,
                })
            })
            .unwrap_or(Value::Null);
        tracing::debug!(block = %scope.block_ref, target = %chosen, "route selected");

        Ok(json!({
            "content": response.content,
            "model": response.model,
            "tokens": {
                "prompt": response.tokens.prompt,
                "completion": response.tokens.completion,
                "total": response.tokens.total,
            },
            "selectedPath": target,
        }))
    }
}
