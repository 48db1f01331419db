//! Chat-completions HTTP provider client.

use std::time::Instant;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::BlockError;
use crate::provider::{
    ProviderChunk, ProviderClient, ProviderRequest, ProviderResponse, TokenUsage, ToolCall,
};

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            default_model: "gpt-4o".to_string(),
        }
    }
}

/// [`ProviderClient`] over an OpenAI-compatible chat-completions API.
pub struct HttpProviderClient {
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProviderClient {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn build_headers(&self, request: &ProviderRequest) -> Result<HeaderMap, BlockError> {
        let mut headers = HeaderMap::new();
        let api_key = request
            .api_key
            .clone()
            .or_else(|| self.config.api_key.clone())
            .ok_or_else(|| BlockError::Auth("no API key configured".to_string()))?;
        let auth = format!("Bearer {}", api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|e| BlockError::InvalidParams(e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn build_payload(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        if let Some(context) = &request.context {
            messages.push(serde_json::json!({"role": "user", "content": context}));
        }

        let model = if request.model.is_empty() {
            self.config.default_model.clone()
        } else {
            request.model.clone()
        };

        let mut payload = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });

        if let Some(temp) = request.temperature {
            if let Some(n) = serde_json::Number::from_f64(temp) {
                payload["temperature"] = Value::Number(n);
            }
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = Value::Number(serde_json::Number::from(max_tokens));
        }
        if !request.tools.is_empty() {
            payload["tools"] = Value::Array(request.tools.clone());
        }
        if let Some(format) = &request.response_format {
            payload["response_format"] = format.clone();
        }
        if stream {
            payload["stream_options"] = serde_json::json!({"include_usage": true});
        }

        payload
    }

    fn parse_usage(body: &Value) -> TokenUsage {
        let usage = body.get("usage").cloned().unwrap_or(Value::Null);
        TokenUsage {
            prompt: usage
                .get("prompt_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            completion: usage
                .get("completion_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            total: usage
                .get("total_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
        }
    }

    fn parse_tool_calls(body: &Value) -> Vec<ToolCall> {
        body.get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("tool_calls"))
            .and_then(|v| v.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let function = call.get("function")?;
                        let name = function.get("name")?.as_str()?.to_string();
                        let arguments = function
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .and_then(|s| serde_json::from_str(s).ok())
                            .unwrap_or(Value::Null);
                        Some(ToolCall {
                            id: call.get("id").and_then(|v| v.as_str()).map(String::from),
                            name,
                            arguments,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse_response(body: &Value, elapsed_ms: u64) -> ProviderResponse {
        let content = body
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        ProviderResponse {
            content,
            model,
            tokens: Self::parse_usage(body),
            tool_calls: Self::parse_tool_calls(body),
            time_ms: elapsed_ms,
            cost: None,
        }
    }

    fn parse_stream_chunk(data: &str) -> Result<Option<ProviderChunk>, BlockError> {
        if data.trim() == "[DONE]" {
            return Ok(None);
        }
        let value: Value =
            serde_json::from_str(data).map_err(|e| BlockError::Stream(e.to_string()))?;
        let delta = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let finish_reason = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let usage = value.get("usage").map(|_| Self::parse_usage(&value));

        Ok(Some(ProviderChunk {
            delta,
            finish_reason,
            usage,
        }))
    }

    fn map_error(status: u16, body: &str) -> BlockError {
        if status == 401 || status == 403 {
            return BlockError::Auth(body.to_string());
        }
        if status == 429 {
            return BlockError::RateLimited(body.to_string());
        }
        BlockError::Provider {
            status,
            message: body.to_string(),
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse, BlockError> {
        let headers = self.build_headers(&request)?;
        let payload = self.build_payload(&request, false);
        let started = Instant::now();

        let response = self
            .client
            .post(self.endpoint())
            .headers(headers)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BlockError::Http(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BlockError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::map_error(status.as_u16(), &text));
        }

        let body: Value = serde_json::from_str(&text).map_err(|_| {
            BlockError::Provider {
                status: status.as_u16(),
                message: format!("non-JSON response body: {}", text.chars().take(200).collect::<String>()),
            }
        })?;
        Ok(Self::parse_response(
            &body,
            started.elapsed().as_millis() as u64,
        ))
    }

    async fn execute_stream(
        &self,
        request: ProviderRequest,
        chunk_tx: mpsc::Sender<ProviderChunk>,
    ) -> Result<ProviderResponse, BlockError> {
        let headers = self.build_headers(&request)?;
        let payload = self.build_payload(&request, true);
        let started = Instant::now();

        let response = self
            .client
            .post(self.endpoint())
            .headers(headers)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BlockError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| BlockError::Http(e.to_string()))?;
            return Err(Self::map_error(status.as_u16(), &text));
        }

        let mut stream = response.bytes_stream().eventsource();
        let mut content = String::new();
        let mut usage = TokenUsage::default();

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| BlockError::Stream(e.to_string()))?;
            match Self::parse_stream_chunk(&event.data)? {
                Some(chunk) => {
                    if !chunk.delta.is_empty() {
                        content.push_str(&chunk.delta);
                    }
                    if let Some(u) = &chunk.usage {
                        usage = *u;
                    }
                    let _ = chunk_tx.send(chunk).await;
                }
                None => break,
            }
        }

        Ok(ProviderResponse {
            content,
            model: request.model,
            tokens: usage,
            tool_calls: Vec::new(),
            time_ms: started.elapsed().as_millis() as u64,
            cost: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn config_for(base_url: String) -> HttpProviderConfig {
        HttpProviderConfig {
            base_url,
            api_key: Some("test-key".into()),
            default_model: "gpt-4o".into(),
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            system_prompt: Some("You are terse.".into()),
            context: Some("hi".into()),
            ..ProviderRequest::default()
        }
    }

    #[tokio::test]
    async fn test_execute_parses_content_and_usage() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                "model": "gpt-4o",
                "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}
            }"#,
            )
            .create_async()
            .await;

        let client = HttpProviderClient::new(config_for(server.url()));
        let resp = client.execute(request()).await.unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.tokens.total, 6);
        assert!(resp.tool_calls.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_execute_parses_tool_calls() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                r#"{
                "model": "gpt-4o",
                "choices": [{"message": {
                    "content": "",
                    "tool_calls": [{"id": "call_1", "function": {"name": "lookup", "arguments": "{\"q\": \"rust\"}"}}]
                }}]
            }"#,
            )
            .create_async()
            .await;

        let client = HttpProviderClient::new(config_for(server.url()));
        let resp = client.execute(request()).await.unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "lookup");
        assert_eq!(resp.tool_calls[0].arguments["q"], "rust");
    }

    #[tokio::test]
    async fn test_auth_errors_map_to_auth() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body("invalid key")
            .create_async()
            .await;

        let client = HttpProviderClient::new(config_for(server.url()));
        let err = client.execute(request()).await.unwrap_err();
        assert!(matches!(err, BlockError::Auth(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_rate_limited() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let client = HttpProviderClient::new(config_for(server.url()));
        let err = client.execute(request()).await.unwrap_err();
        assert!(matches!(err, BlockError::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_non_json_success_body_is_a_provider_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body("<html>gateway</html>")
            .create_async()
            .await;

        let client = HttpProviderClient::new(config_for(server.url()));
        let err = client.execute(request()).await.unwrap_err();
        assert!(matches!(err, BlockError::Provider { .. }));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_any_request() {
        let client = HttpProviderClient::new(HttpProviderConfig {
            api_key: None,
            ..HttpProviderConfig::default()
        });
        let err = client.execute(request()).await.unwrap_err();
        assert!(matches!(err, BlockError::Auth(_)));
    }

    #[tokio::test]
    async fn test_execute_stream_collects_deltas() {
        let mut server = Server::new_async().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
        data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}}\n\n\
        data: [DONE]\n\n";
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = HttpProviderClient::new(config_for(server.url()));
        let (tx, mut rx) = mpsc::channel(8);
        let resp = client.execute_stream(request(), tx).await.unwrap();
        assert_eq!(resp.content, "Hello");
        assert_eq!(resp.tokens.total, 2);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.delta, "Hel");
    }
}
