//! Engine layer.
//!
//! This module contains:
//! - The execution engine boundary (batch descriptor, step output)
//! - LLMEngine for driving the step loop
//! - EngineHandle for concurrent producers
//! - SyntheticEngine, a seeded stand-in for a model

pub mod executor;
pub mod handle;
pub mod llm;
pub mod synthetic;

pub use executor::{BatchDescriptor, BatchEntry, ExecutionEngine, SequenceOutput, StepOutput};
pub use handle::{spawn_engine, EngineHandle};
pub use llm::{LLMEngine, Submitter};
pub use synthetic::SyntheticEngine;
