//! Serialized workflow schema.
//!
//! [`SerializedWorkflow`] is the immutable input to the engine: blocks,
//! connections, and loop/parallel subflow descriptors, in the camelCase JSON
//! shape the visual editor produces. Nothing in this module is mutated
//! during execution; all run state lives in
//! [`ExecutionContext`](crate::core::ExecutionContext).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_params() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_iterations() -> usize {
    1
}

/// Canvas position. Layout-only, ignored by execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

/// Block kind discriminant (`metadata.id` in the serialized form).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Starter,
    Agent,
    Api,
    Condition,
    Router,
    Evaluator,
    Function,
    Loop,
    Parallel,
    Response,
    Workflow,
    Generic,
    Webhook,
    Schedule,
    /// Any discriminant this engine has no dedicated handler for. Executed
    /// by the generic pass-through handler.
    #[serde(other)]
    Unknown,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Starter => "starter",
            BlockKind::Agent => "agent",
            BlockKind::Api => "api",
            BlockKind::Condition => "condition",
            BlockKind::Router => "router",
            BlockKind::Evaluator => "evaluator",
            BlockKind::Function => "function",
            BlockKind::Loop => "loop",
            BlockKind::Parallel => "parallel",
            BlockKind::Response => "response",
            BlockKind::Workflow => "workflow",
            BlockKind::Generic => "generic",
            BlockKind::Webhook => "webhook",
            BlockKind::Schedule => "schedule",
            BlockKind::Unknown => "unknown",
        }
    }

    /// Trigger kinds act as entry data sources and never run logic.
    pub fn is_trigger(&self) -> bool {
        matches!(self, BlockKind::Webhook | BlockKind::Schedule)
    }

    /// Loop and parallel coordinator blocks are re-invoked across
    /// scheduling passes until their region completes.
    pub fn is_subflow(&self) -> bool {
        matches!(self, BlockKind::Loop | BlockKind::Parallel)
    }

    /// Kinds whose recorded choice auto-satisfies unchosen branch edges.
    pub fn makes_decisions(&self) -> bool {
        matches!(self, BlockKind::Router | BlockKind::Condition)
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block metadata: the kind discriminant plus the user-facing name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub id: BlockKind,
    #[serde(default)]
    pub name: Option<String>,
}

/// Kind-specific raw parameters. Values may contain unresolved reference
/// syntax until the input resolver runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    #[serde(default = "default_params")]
    pub params: Value,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            params: default_params(),
        }
    }
}

/// A single node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedBlock {
    pub id: String,
    #[serde(default)]
    pub position: Position,
    pub metadata: BlockMetadata,
    #[serde(default)]
    pub config: BlockConfig,
    /// Declared input types. Informational only.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Declared output types. Informational only.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SerializedBlock {
    pub fn kind(&self) -> BlockKind {
        self.metadata.id
    }

    /// User-facing name, falling back to the id.
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or(&self.id)
    }

    /// Dual-purpose blocks carry a `triggerMode` param when configured as
    /// the workflow entry instead of a mid-graph step.
    pub fn trigger_mode(&self) -> bool {
        self.config
            .params
            .get("triggerMode")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether this block can act as the workflow entry point.
    pub fn is_entry(&self) -> bool {
        self.kind() == BlockKind::Starter || self.kind().is_trigger() || self.trigger_mode()
    }
}

/// Handle tag distinguishing multiple outgoing paths from one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionHandle {
    #[default]
    #[serde(rename = "source")]
    Source,
    #[serde(rename = "condition-true")]
    ConditionTrue,
    #[serde(rename = "condition-false")]
    ConditionFalse,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "loop-start-source")]
    LoopStart,
    #[serde(rename = "loop-end-source")]
    LoopEnd,
    #[serde(rename = "parallel-start-source")]
    ParallelStart,
    #[serde(rename = "parallel-end-source")]
    ParallelEnd,
}

impl ConnectionHandle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionHandle::Source => "source",
            ConnectionHandle::ConditionTrue => "condition-true",
            ConnectionHandle::ConditionFalse => "condition-false",
            ConnectionHandle::Error => "error",
            ConnectionHandle::LoopStart => "loop-start-source",
            ConnectionHandle::LoopEnd => "loop-end-source",
            ConnectionHandle::ParallelStart => "parallel-start-source",
            ConnectionHandle::ParallelEnd => "parallel-end-source",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionHandle::Error)
    }

    /// Edges that feed a subflow body from its coordinator block.
    pub fn is_subflow_start(&self) -> bool {
        matches!(
            self,
            ConnectionHandle::LoopStart | ConnectionHandle::ParallelStart
        )
    }

    /// Edges that leave a subflow region after aggregation.
    pub fn is_subflow_end(&self) -> bool {
        matches!(
            self,
            ConnectionHandle::LoopEnd | ConnectionHandle::ParallelEnd
        )
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed link between two blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub source: String,
    pub target: String,
    #[serde(default, alias = "source_handle")]
    pub source_handle: ConnectionHandle,
    #[serde(default, alias = "target_handle")]
    pub target_handle: Option<String>,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: ConnectionHandle::Source,
            target_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: ConnectionHandle) -> Self {
        self.source_handle = handle;
        self
    }
}

/// Loop kind: fixed-count or per-item over a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopType {
    #[default]
    For,
    ForEach,
}

/// Loop region descriptor, keyed by the loop block's id in
/// [`SerializedWorkflow::loops`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopDescriptor {
    #[serde(default)]
    pub id: String,
    /// Ordered ids of the blocks forming the loop body.
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Iteration count for `for` loops.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub loop_type: LoopType,
    /// Collection for `forEach` loops: a JSON array/object literal, or a
    /// string expression evaluated when the loop activates.
    #[serde(default)]
    pub for_each_items: Value,
}

/// Parallel kind: explicit fan-out width or one branch per collection item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParallelType {
    Count,
    #[default]
    Collection,
}

/// Parallel region descriptor, keyed by the parallel block's id in
/// [`SerializedWorkflow::parallels`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelDescriptor {
    #[serde(default)]
    pub id: String,
    /// Ids of the blocks forming the parallel body.
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Explicit fan-out width for `count` parallels.
    #[serde(default)]
    pub count: Option<usize>,
    /// Collection to distribute for `collection` parallels: array, keyed
    /// object, or string expression evaluated when the region activates.
    #[serde(default)]
    pub distribution: Value,
    #[serde(default)]
    pub parallel_type: ParallelType,
}

/// The complete serialized workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedWorkflow {
    #[serde(default = "default_version")]
    pub version: String,
    pub blocks: Vec<SerializedBlock>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub loops: HashMap<String, LoopDescriptor>,
    #[serde(default)]
    pub parallels: HashMap<String, ParallelDescriptor>,
}

impl SerializedWorkflow {
    /// Parse from the editor's JSON form.
    pub fn from_json(content: &str) -> Result<Self, crate::error::WorkflowError> {
        serde_json::from_str(content)
            .map_err(|e| crate::error::WorkflowError::InvalidWorkflow(e.to_string()))
    }

    pub fn block(&self, id: &str) -> Option<&SerializedBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// The single enabled entry block, if the graph has exactly one. The
    /// full invariant is enforced by
    /// [`validate_workflow`](crate::workflow::validate_workflow).
    pub fn entry_block(&self) -> Option<&SerializedBlock> {
        self.blocks.iter().find(|b| b.enabled && b.is_entry())
    }

    pub fn incoming(&self, block_id: &str) -> impl Iterator<Item = &Connection> + '_ {
        let id = block_id.to_string();
        self.connections.iter().filter(move |c| c.target == id)
    }

    pub fn outgoing(&self, block_id: &str) -> impl Iterator<Item = &Connection> + '_ {
        let id = block_id.to_string();
        self.connections.iter().filter(move |c| c.source == id)
    }

    /// The loop region whose body contains `block_id`, if any.
    pub fn containing_loop(&self, block_id: &str) -> Option<&LoopDescriptor> {
        self.loops
            .values()
            .find(|l| l.nodes.iter().any(|n| n == block_id))
    }

    /// The parallel region whose body contains `block_id`, if any.
    pub fn containing_parallel(&self, block_id: &str) -> Option<&ParallelDescriptor> {
        self.parallels
            .values()
            .find(|p| p.nodes.iter().any(|n| n == block_id))
    }
}
