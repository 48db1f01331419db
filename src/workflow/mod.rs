//! Serialized workflow model and construction-time validation.

pub mod schema;
pub mod validation;

pub use schema::{
    BlockConfig, BlockKind, BlockMetadata, Connection, ConnectionHandle, LoopDescriptor, LoopType,
    ParallelDescriptor, ParallelType, Position, SerializedBlock, SerializedWorkflow,
};
pub use validation::validate_workflow;
