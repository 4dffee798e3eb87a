//! Core infrastructure for inflight-batcher.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for the paged KV cache
//! - BlockPool for reference-counted block allocation
//! - Sequence for per-sample token history
//! - Request and Registry for request lifecycle

pub mod block;
pub mod block_pool;
pub mod registry;
pub mod request;
pub mod sequence;
