mod context;
mod engine;
mod task;

pub use context::MessageStream;
pub use engine::{
    AppliedChunk, ChunkOutcome, ChunkPhase, PendingChunk, PendingKind, StreamEngine,
    StreamSession, StreamStatus,
};
pub use task::{StreamTask, StreamTaskStatus};

pub(crate) use task::Termination;
