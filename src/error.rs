//! Error types for inflight-batcher.

use thiserror::Error;

use crate::core::block::BlockId;
use crate::core::request::RequestId;

/// Result type alias for inflight-batcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for inflight-batcher.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - fewer free blocks than requested.
    #[error("out of KV cache blocks (requested {requested}, available {available})")]
    OutOfBlocks { requested: usize, available: usize },

    /// A block handle was freed or shared while not allocated.
    #[error("invalid block handle {0}: not allocated")]
    InvalidBlock(BlockId),

    /// Logical block index not present in a block table.
    #[error("logical block {logical_idx} out of bounds (table has {num_blocks} blocks)")]
    BlockIndexOutOfBounds {
        logical_idx: usize,
        num_blocks: usize,
    },

    /// The request can never fit in the block pool.
    #[error("resource exhausted: request needs {required} blocks, pool capacity is {capacity}")]
    ResourceExhausted { required: usize, capacity: usize },

    /// Prompt exceeds the per-step token budget.
    #[error("prompt of {prompt_len} tokens exceeds max_aggregate_tokens ({limit})")]
    PromptTooLong { prompt_len: usize, limit: usize },

    /// Malformed submission.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Request not found in the registry.
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// Invalid request state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The execution engine failed a step.
    #[error("execution engine error: {0}")]
    Engine(#[from] EngineError),

    /// Block accounting no longer balances.
    #[error("block accounting violated: {0}")]
    InvariantViolation(String),

    /// The engine loop is no longer running.
    #[error("engine loop has stopped")]
    EngineStopped,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure reported by an [`ExecutionEngine`](crate::engine::ExecutionEngine).
///
/// Any engine error invalidates every request of the batch it was raised for.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine rejected the batch descriptor.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// The engine returned no output for a scheduled sequence.
    #[error("no output for sequence {0}")]
    MissingOutput(u64),

    /// The engine returned output for a sequence that was not scheduled.
    #[error("output for unscheduled sequence {0}")]
    UnknownSequence(u64),

    /// The engine returned the wrong number of tokens for a sequence.
    #[error("sequence {seq_id} returned {got} tokens, expected {expected}")]
    UnexpectedTokenCount {
        seq_id: u64,
        expected: usize,
        got: usize,
    },

    /// Device or runtime failure while executing the step.
    #[error("step failed: {0}")]
    StepFailed(String),
}
