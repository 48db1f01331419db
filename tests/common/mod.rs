#![allow(dead_code)]

//! Shared fixtures for the integration suites: scripted provider
//! doubles and workflow builders.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use blockflow::{
    BlockError, ProviderChunk, ProviderClient, ProviderRequest, ProviderResponse,
    SerializedWorkflow, TokenUsage, WorkflowSource,
};

/// Parse an inline JSON workflow definition.
pub fn workflow(definition: serde_json::Value) -> SerializedWorkflow {
    init_tracing();
    SerializedWorkflow::from_json(&definition.to_string()).unwrap()
}

/// Install the test subscriber once; later calls are no-ops. Run with
/// `RUST_LOG=blockflow=debug` to see scheduling passes.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Provider double that pops scripted replies in order and records every
/// request it saw. Once the script is exhausted it keeps answering with
/// the last reply.
pub struct MockProvider {
    replies: Mutex<Vec<String>>,
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl MockProvider {
    pub fn fixed(content: &str) -> Arc<Self> {
        Self::scripted(&[content])
    }

    pub fn scripted(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_reply(&self) -> String {
        let mut replies = self.replies.lock();
        if replies.len() > 1 {
            replies.remove(0)
        } else {
            replies.first().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse, BlockError> {
        self.requests.lock().push(request);
        Ok(ProviderResponse {
            content: self.next_reply(),
            model: "mock-model".to_string(),
            tokens: TokenUsage {
                prompt: 10,
                completion: 5,
                total: 15,
            },
            time_ms: 1,
            ..Default::default()
        })
    }
}

/// Provider double that streams a fixed chunk sequence before returning
/// the assembled response.
pub struct StreamingMockProvider {
    chunks: Vec<String>,
}

impl StreamingMockProvider {
    pub fn new(chunks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
        })
    }

    fn full_content(&self) -> String {
        self.chunks.concat()
    }
}

#[async_trait]
impl ProviderClient for StreamingMockProvider {
    async fn execute(&self, _request: ProviderRequest) -> Result<ProviderResponse, BlockError> {
        Ok(ProviderResponse {
            content: self.full_content(),
            model: "mock-model".to_string(),
            ..Default::default()
        })
    }

    async fn execute_stream(
        &self,
        _request: ProviderRequest,
        chunk_tx: mpsc::Sender<ProviderChunk>,
    ) -> Result<ProviderResponse, BlockError> {
        for chunk in &self.chunks {
            let _ = chunk_tx
                .send(ProviderChunk {
                    delta: chunk.clone(),
                    ..Default::default()
                })
                .await;
        }
        Ok(ProviderResponse {
            content: self.full_content(),
            model: "mock-model".to_string(),
            ..Default::default()
        })
    }
}

/// Provider double that signals when a call starts and holds it until
/// the test releases it.
pub struct GatedProvider {
    started_tx: mpsc::Sender<()>,
    release: tokio::sync::Semaphore,
}

impl GatedProvider {
    /// Returns the provider and a receiver that yields once per call as
    /// it begins.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<()>) {
        let (started_tx, started_rx) = mpsc::channel(8);
        (
            Arc::new(Self {
                started_tx,
                release: tokio::sync::Semaphore::new(0),
            }),
            started_rx,
        )
    }

    pub fn release_one(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl ProviderClient for GatedProvider {
    async fn execute(&self, _request: ProviderRequest) -> Result<ProviderResponse, BlockError> {
        let _ = self.started_tx.send(()).await;
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|_| BlockError::Execution("gate closed".to_string()))?;
        permit.forget();
        Ok(ProviderResponse {
            content: "released".to_string(),
            model: "mock-model".to_string(),
            ..Default::default()
        })
    }
}

/// In-memory workflow source for nested-run tests.
pub struct InMemorySource {
    workflows: HashMap<String, SerializedWorkflow>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self {
            workflows: HashMap::new(),
        }
    }

    pub fn insert(mut self, id: &str, workflow: SerializedWorkflow) -> Self {
        self.workflows.insert(id.to_string(), workflow);
        self
    }
}

#[async_trait]
impl WorkflowSource for InMemorySource {
    async fn load(&self, workflow_id: &str) -> Result<SerializedWorkflow, BlockError> {
        self.workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| BlockError::Execution(format!("unknown workflow \"{workflow_id}\"")))
    }
}
