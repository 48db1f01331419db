//! Evaluator block handler.
//!
//! Sends content to the provider together with a list of metrics and
//! reads numeric scores back out of the reply. Models wrap JSON in
//! markdown fences or prose, so fences are stripped, metric names match
//! case-insensitively, and a score that cannot be read becomes 0 instead
//! of failing the block.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::provider::ProviderRequest;
use crate::workflow::schema::{BlockKind, SerializedBlock};

pub struct EvaluatorHandler;

fn scoring_prompt(content: &str, metrics: &[Value]) -> String {
    let mut prompt = String::from(
        "Evaluate the following content against each metric. Respond with \
         a JSON object mapping every metric name to a numeric score and \
         nothing else.\nMetrics:\n",
    );
    for metric in metrics {
        let name = metric.get("name").and_then(Value::as_str).unwrap_or("");
        let description = metric
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");
        let min = metric
            .get("range")
            .and_then(|r| r.get("min"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let max = metric
            .get("range")
            .and_then(|r| r.get("max"))
            .and_then(Value::as_f64)
            .unwrap_or(10.0);
        prompt.push_str(&format!("- {name} ({min}-{max}): {description}\n"));
    }
    prompt.push_str("\nContent:\n");
    prompt.push_str(content);
    prompt
}

/// Strip markdown code fences so `serde_json` sees only the payload.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn parse_scores(content: &str, metrics: &[Value]) -> Map<String, Value> {
    let parsed: Value = serde_json::from_str(strip_fences(content)).unwrap_or(Value::Null);
    let mut scores = Map::new();
    for metric in metrics {
        let Some(name) = metric.get("name").and_then(Value::as_str) else {
            continue;
        };
        let score = parsed
            .as_object()
            .and_then(|obj| {
                obj.iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
            })
            .and_then(|value| match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            })
            .unwrap_or(0.0);
        scores.insert(
            name.to_lowercase(),
            serde_json::Number::from_f64(score)
                .map(Value::Number)
                .unwrap_or(json!(0)),
        );
    }
    scores
}

#[async_trait]
impl BlockHandler for EvaluatorHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Evaluator]
    }

    async fn execute(
        &self,
        block: &SerializedBlock,
        inputs: &Value,
        _ctx: &ExecutionContext,
        scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        let metrics: Vec<Value> = inputs
            .get("metrics")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if metrics.is_empty() {
            return Err(BlockError::InvalidParams(format!(
                "evaluator \"{}\" has no metrics to score",
                block.id
            )));
        }
        let content = match inputs.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };

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
            system_prompt: Some(scoring_prompt(&content, &metrics)),
            context: Some("Score the content now.".to_string()),
            temperature: inputs.get("temperature").and_then(Value::as_f64),
            api_key: inputs
                .get("apiKey")
                .and_then(Value::as_str)
                .map(String::from),
            ..ProviderRequest::default()
        };

        let response = scope.provider()?.execute(request).await?;
        let mut output = Map::new();
        output.insert("content".to_string(), Value::String(content));
        output.insert("model".to_string(), Value::String(response.model));
        output.insert(
            "tokens".to_string(),
            json!({
                "prompt": response.tokens.prompt,
                "completion": response.tokens.completion,
                "total": response.tokens.total,
            }),
        );
        for (name, score) in parse_scores(&response.content, &metrics) {
            output.insert(name, score);
        }
        Ok(Value::Object(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::core::block_ref::BlockRef;
    use crate::provider::{ProviderClient, ProviderResponse};
    use crate::resolver::Resolver;
    use crate::workflow::schema::SerializedWorkflow;
    use std::sync::Arc;

    struct FixedProvider(&'static str);

    #[async_trait]
    impl ProviderClient for FixedProvider {
        async fn execute(
            &self,
            _request: ProviderRequest,
        ) -> Result<ProviderResponse, BlockError> {
            Ok(ProviderResponse {
                content: self.0.to_string(),
                model: "test-model".to_string(),
                ..ProviderResponse::default()
            })
        }
    }

    fn workflow() -> SerializedWorkflow {
        SerializedWorkflow::from_json(
            &serde_json::to_string(&json!({
                "version": "1.0",
                "blocks": [{"id": "eval", "metadata": {"id": "evaluator", "name": "Score"}}],
                "connections": []
            }))
            .unwrap(),
        )
        .unwrap()
    }

    async fn run(reply: &'static str, inputs: Value) -> Result<Value, BlockError> {
        let workflow = workflow();
        let resolver = Resolver::new(&workflow);
        let config = ExecutorConfig::default();
        let block_ref = BlockRef::real("eval");
        let scope = ExecutionScope {
            block_ref: &block_ref,
            workflow: &workflow,
            resolver: &resolver,
            provider: Some(Arc::new(FixedProvider(reply))),
            workflow_source: None,
            config: &config,
            streaming_eligible: false,
        };
        let ctx = ExecutionContext::new("wf");
        let block = workflow.block("eval").unwrap().clone();
        EvaluatorHandler.execute(&block, &inputs, &ctx, &scope).await
    }

    fn metric_inputs() -> Value {
        json!({
            "content": "The quick brown fox",
            "metrics": [
                {"name": "Clarity", "description": "how clear", "range": {"min": 0, "max": 10}},
                {"name": "Accuracy", "description": "how accurate", "range": {"min": 0, "max": 10}}
            ]
        })
    }

    #[tokio::test]
    async fn test_scores_extracted_case_insensitively() {
        let output = run(r#"{"clarity": 8, "ACCURACY": 6.5}"#, metric_inputs())
            .await
            .unwrap();
        assert_eq!(output["clarity"], json!(8.0));
        assert_eq!(output["accuracy"], json!(6.5));
        assert_eq!(output["content"], json!("The quick brown fox"));
    }

    #[tokio::test]
    async fn test_fenced_reply_is_parsed() {
        let output = run("```json\n{\"clarity\": 9, \"accuracy\": 4}\n```", metric_inputs())
            .await
            .unwrap();
        assert_eq!(output["clarity"], json!(9.0));
        assert_eq!(output["accuracy"], json!(4.0));
    }

    #[tokio::test]
    async fn test_unparseable_reply_scores_zero() {
        let output = run("I refuse to answer in JSON.", metric_inputs())
            .await
            .unwrap();
        assert_eq!(output["clarity"], json!(0.0));
        assert_eq!(output["accuracy"], json!(0.0));
    }

    #[tokio::test]
    async fn test_missing_metrics_is_invalid() {
        let err = run("{}", json!({"content": "x"})).await.unwrap_err();
        assert!(matches!(err, BlockError::InvalidParams(_)));
    }
}
