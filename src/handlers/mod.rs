//! Block handlers.
//!
//! Each block kind maps to exactly one [`BlockHandler`]; the registry is
//! keyed by [`BlockKind`], so dispatch is a single map lookup. Handlers
//! receive fully resolved inputs and never mutate graph structure: they
//! compute an output, and branching handlers additionally record their
//! decision in the context.

pub mod agent;
pub mod api;
pub mod condition;
pub mod evaluator;
pub mod function;
pub mod generic;
pub mod response;
pub mod router;
pub mod subflow;
pub mod trigger;
pub mod workflow;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ExecutorConfig;
use crate::core::block_ref::BlockRef;
use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::provider::ProviderClient;
use crate::resolver::Resolver;
use crate::workflow::schema::{BlockKind, SerializedBlock, SerializedWorkflow};

pub use workflow::WorkflowSource;

/// Everything a handler may need beyond the context: the instance being
/// executed, graph access, and injected backends.
pub struct ExecutionScope<'a> {
    /// The real or virtual instance being executed.
    pub block_ref: &'a BlockRef,
    pub workflow: &'a SerializedWorkflow,
    pub resolver: &'a Resolver<'a>,
    pub provider: Option<Arc<dyn ProviderClient>>,
    pub workflow_source: Option<Arc<dyn WorkflowSource>>,
    pub config: &'a ExecutorConfig,
    /// Whether this block's output may stream live to the run's consumer.
    pub streaming_eligible: bool,
}

impl ExecutionScope<'_> {
    pub fn provider(&self) -> Result<Arc<dyn ProviderClient>, BlockError> {
        self.provider
            .clone()
            .ok_or_else(|| BlockError::Execution("no provider client configured".to_string()))
    }
}

/// One block kind's execution logic.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    /// Kinds this handler executes.
    fn kinds(&self) -> &'static [BlockKind];

    /// Whether this handler executes the given block's kind.
    fn can_handle(&self, block: &SerializedBlock) -> bool {
        self.kinds().contains(&block.kind())
    }

    async fn execute(
        &self,
        block: &SerializedBlock,
        inputs: &Value,
        ctx: &ExecutionContext,
        scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError>;
}

/// Kind-keyed handler table.
pub struct HandlerRegistry {
    handlers: HashMap<BlockKind, Arc<dyn BlockHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut registry = HandlerRegistry {
            handlers: HashMap::new(),
        };
        registry.register(Arc::new(trigger::TriggerHandler));
        registry.register(Arc::new(agent::AgentHandler));
        registry.register(Arc::new(api::ApiHandler::new()));
        registry.register(Arc::new(function::FunctionHandler));
        registry.register(Arc::new(condition::ConditionHandler));
        registry.register(Arc::new(router::RouterHandler));
        registry.register(Arc::new(evaluator::EvaluatorHandler));
        registry.register(Arc::new(response::ResponseHandler));
        registry.register(Arc::new(workflow::WorkflowHandler));
        registry.register(Arc::new(generic::GenericHandler));
        registry.register(Arc::new(subflow::LoopBlockHandler));
        registry.register(Arc::new(subflow::ParallelBlockHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn BlockHandler>) {
        for kind in handler.kinds() {
            self.handlers.insert(*kind, handler.clone());
        }
    }

    pub fn get(&self, kind: BlockKind) -> Option<&Arc<dyn BlockHandler>> {
        self.handlers.get(&kind)
    }

    /// Handler for a concrete block. A block configured as a trigger-mode
    /// entry executes as a trigger regardless of its kind.
    pub fn for_block(&self, block: &SerializedBlock) -> Option<&Arc<dyn BlockHandler>> {
        if block.trigger_mode() {
            return self.handlers.get(&BlockKind::Starter);
        }
        self.handlers.get(&block.kind())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_kind_has_a_handler() {
        let registry = HandlerRegistry::new();
        for kind in [
            BlockKind::Starter,
            BlockKind::Agent,
            BlockKind::Api,
            BlockKind::Condition,
            BlockKind::Router,
            BlockKind::Evaluator,
            BlockKind::Function,
            BlockKind::Loop,
            BlockKind::Parallel,
            BlockKind::Response,
            BlockKind::Workflow,
            BlockKind::Generic,
            BlockKind::Webhook,
            BlockKind::Schedule,
            BlockKind::Unknown,
        ] {
            assert!(registry.get(kind).is_some(), "no handler for {kind}");
        }
    }

    #[test]
    fn test_trigger_mode_overrides_kind() {
        let registry = HandlerRegistry::new();
        let block: SerializedBlock = serde_json::from_value(json!({
            "id": "a1",
            "metadata": {"id": "agent", "name": "Agent Entry"},
            "config": {"params": {"triggerMode": true}}
        }))
        .unwrap();
        let handler = registry.for_block(&block).unwrap();
        assert!(handler.kinds().contains(&BlockKind::Starter));
    }

    #[test]
    fn test_can_handle_follows_registered_kinds() {
        let registry = HandlerRegistry::new();
        let block: SerializedBlock = serde_json::from_value(json!({
            "id": "f1",
            "metadata": {"id": "function", "name": "Fn"}
        }))
        .unwrap();
        assert!(registry.get(BlockKind::Function).unwrap().can_handle(&block));
        assert!(!registry.get(BlockKind::Agent).unwrap().can_handle(&block));
    }
}
