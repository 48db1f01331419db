//! # Blockflow: a workflow execution engine
//!
//! `blockflow` executes serialized workflow graphs: blocks wired by
//! handle-tagged connections, with loop and parallel regions described
//! alongside the graph. It supports:
//!
//! - **Block execution**: Starter, Agent, API, Function, Condition,
//!   Router, Evaluator, Response, Workflow (nested runs), Loop and
//!   Parallel coordinators, plus a pass-through for tool-style blocks.
//! - **Path tracking**: router and condition decisions prune the active
//!   path so unchosen branches never execute.
//! - **Loop and parallel regions**: body blocks run as per-iteration
//!   virtual instances with scoped state and aggregated results.
//! - **Reference resolution**: `<block.path>` references, `{{ENV_VAR}}`
//!   secrets, `<variable.name>` workflow variables, and `<loop.*>` /
//!   `<parallel.*>` iteration scope.
//! - **Error connections**: a block failure can route to an error handler
//!   instead of ending the run.
//! - **Streaming**: selected block outputs stream live while the run
//!   continues, with the full result available at the end.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use blockflow::Executor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let json = std::fs::read_to_string("workflow.json").unwrap();
//!     let workflow = blockflow::SerializedWorkflow::from_json(&json).unwrap();
//!     let executor = Executor::builder(workflow).build().unwrap();
//!     let outcome = executor.execute("my-workflow").await.unwrap();
//!     println!("{:?}", outcome.execution().output);
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod expression;
pub mod handlers;
pub mod provider;
pub mod resolver;
pub mod workflow;

pub use crate::config::ExecutorConfig;
pub use crate::core::block_ref::{BlockRef, SubflowKind};
pub use crate::core::context::{
    BlockLog, CancellationHandle, ExecutionContext, OnStreamCallback, StreamingContext,
};
pub use crate::core::events::{event_channel, EventReceiver, EventSender, ExecutionEvent};
pub use crate::core::stream::{OutputChunk, OutputStream, StreamReader, StreamWriter};
pub use crate::error::{BlockError, BlockResult, WorkflowError, WorkflowResult};
pub use crate::executor::{
    ExecutionMetadata, ExecutionOutcome, ExecutionResult, Executor, ExecutorBuilder,
    StreamingExecution, StreamingOptions,
};
pub use crate::handlers::{BlockHandler, ExecutionScope, HandlerRegistry, WorkflowSource};
pub use crate::provider::{
    ProviderChunk, ProviderClient, ProviderRequest, ProviderResponse, TokenUsage, ToolCall,
};
pub use crate::resolver::Resolver;
pub use crate::workflow::schema::{
    BlockKind, Connection, ConnectionHandle, LoopDescriptor, ParallelDescriptor, SerializedBlock,
    SerializedWorkflow,
};
pub use crate::workflow::validate_workflow;
