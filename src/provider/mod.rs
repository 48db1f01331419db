//! Model provider boundary.
//!
//! Agent, router, and evaluator blocks delegate inference to a
//! [`ProviderClient`]. The engine owns the request/response shapes and
//! nothing else: callers inject an implementation (the bundled
//! [`HttpProviderClient`] speaks the chat-completions wire form) or a
//! test double.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::BlockError;

pub use http::HttpProviderClient;

/// One inference call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// User-facing content for this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: i64,
    pub completion: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// What a provider call produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub content: String,
    pub model: String,
    pub tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Incremental delta of a streamed call.
#[derive(Debug, Clone, Default)]
pub struct ProviderChunk {
    pub delta: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Abstract inference backend.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse, BlockError>;

    /// Streamed variant: deltas go to `chunk_tx` while the full response
    /// is still returned. The default forwards the non-streamed result as
    /// a single chunk, which lets simple backends ignore streaming.
    async fn execute_stream(
        &self,
        request: ProviderRequest,
        chunk_tx: mpsc::Sender<ProviderChunk>,
    ) -> Result<ProviderResponse, BlockError> {
        let response = self.execute(request).await?;
        let _ = chunk_tx
            .send(ProviderChunk {
                delta: response.content.clone(),
                finish_reason: Some("stop".to_string()),
                usage: Some(response.tokens),
            })
            .await;
        Ok(response)
    }
}
