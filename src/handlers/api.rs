//! API block handler.
//!
//! Plain HTTP request block. Url, method, headers, query params, and
//! body all arrive resolved; the response body is surfaced as JSON when
//! it parses and as a string otherwise. Non-2xx statuses fail the block,
//! which makes them routable through an error connection.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};

use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::workflow::schema::{BlockKind, SerializedBlock};

pub struct ApiHandler {
    client: reqwest::Client,
}

impl ApiHandler {
    pub fn new() -> Self {
        ApiHandler {
            client: reqwest::Client::builder()
                .pool_max_idle_per_host(10)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for ApiHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Key/value pairs from either an object map or a table-style array of
/// `{"key": ..., "value": ...}` (or `{"cells": {"Key": ..., "Value": ...}}`)
/// entries.
fn entries(value: Option<&Value>) -> Vec<(String, String)> {
    let as_text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match value {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), as_text(v))).collect(),
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(|row| {
                let cells = row.get("cells").unwrap_or(row);
                let key = cells
                    .get("key")
                    .or_else(|| cells.get("Key"))
                    .and_then(Value::as_str)?;
                let value = cells.get("value").or_else(|| cells.get("Value"))?;
                Some((key.to_string(), as_text(value)))
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl BlockHandler for ApiHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Api]
    }

    async fn execute(
        &self,
        block: &SerializedBlock,
        inputs: &Value,
        _ctx: &ExecutionContext,
        scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        let url = inputs
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                BlockError::InvalidParams(format!("api block \"{}\" has no url", block.id))
            })?;
        let method_name = inputs
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method: Method = method_name.parse().map_err(|_| {
            BlockError::InvalidParams(format!("unsupported HTTP method \"{method_name}\""))
        })?;

        let mut request = self.client.request(method.clone(), url);
        for (key, value) in entries(inputs.get("headers")) {
            request = request.header(key, value);
        }
        let query = entries(inputs.get("params"));
        if !query.is_empty() {
            request = request.query(&query);
        }
        match inputs.get("body") {
            Some(Value::Null) | None => {}
            Some(Value::String(s)) => request = request.body(s.clone()),
            Some(body) => request = request.json(body),
        }
        let timeout = inputs
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(scope.config.block_timeout_secs);

        let response = request
            .timeout(Duration::from_secs(timeout))
            .send()
            .await
            .map_err(|e| BlockError::Http(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            );
        }
        let body = response
            .text()
            .await
            .map_err(|e| BlockError::Http(format!("failed to read response body: {e}")))?;
        let data = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));

        if !status.is_success() {
            return Err(BlockError::Http(format!(
                "{method} {url} returned status {}: {}",
                status.as_u16(),
                truncate(&data.to_string(), 200)
            )));
        }

        Ok(json!({
            "data": data,
            "status": status.as_u16(),
            "headers": headers,
        }))
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
