pub mod block_ref;
pub mod context;
pub mod events;
pub mod loop_manager;
pub mod parallel_manager;
pub mod path;
pub mod stream;
pub mod subflow;

pub use block_ref::{BlockRef, SubflowKind};
pub use context::{
    BlockLog, BlockState, CancellationHandle, DistributionItems, ExecutionContext, LoopState,
    OnStreamCallback, ParallelState, StreamingContext,
};
pub use events::{event_channel, EventReceiver, EventSender, ExecutionEvent};
pub use loop_manager::{LoopManager, LoopPhase};
pub use parallel_manager::{ParallelManager, ParallelPhase, MAX_PARALLEL_BRANCHES};
pub use path::PathTracker;
pub use stream::{channel, OutputChunk, OutputStream, StreamEvent, StreamReader, StreamWriter};
