//! inflight-batcher: continuous batching over a paged KV cache.
//!
//! This crate implements the serving core of an LLM inference engine:
//! - A reference-counted block pool with copy-on-write and prefix caching
//! - Iteration-level ("in-flight") batching with priority admission
//! - Preemption by recompute or swap under memory pressure
//! - An engine loop fed through a channel by concurrent producers
//!
//! The numerical work is behind the [`ExecutionEngine`] trait.

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{CacheConfig, EngineConfig, PreemptionMode, SchedulerConfig};
pub use crate::core::request::{
    CompletionOutput, GenerationParams, GenerationRequest, RequestId, RequestOutput, RequestStatus,
};
pub use crate::core::sequence::FinishReason;
pub use engine::{
    spawn_engine, BatchDescriptor, EngineHandle, ExecutionEngine, LLMEngine, StepOutput,
    Submitter, SyntheticEngine,
};
pub use error::{EngineError, Error, Result};
pub use scheduler::{Scheduler, SchedulerStats};
