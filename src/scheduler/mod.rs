//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - Priority-ordered admission of queued requests
//! - Iteration-level batching with block allocation and copy-on-write
//! - Preemption of low-priority requests under memory pressure

pub mod batch;
pub mod preempt;
pub mod queue;

pub use batch::{validate_request, Scheduler, SchedulerStats};
pub use queue::AdmissionQueue;
