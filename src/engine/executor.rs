//! Boundary between the scheduler and the execution engine.
//!
//! The scheduler hands a [`BatchDescriptor`] to an [`ExecutionEngine`] once
//! per step and gets a [`StepOutput`] back. The engine is opaque: it may run
//! a model, replay a script, or draw random tokens.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::block::BlockId;
use crate::core::request::RequestId;
use crate::core::sequence::SequenceId;
use crate::error::EngineError;

/// Work for one sequence in one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub request_id: RequestId,
    pub seq_id: SequenceId,
    /// Physical blocks in logical order.
    pub block_ids: Vec<BlockId>,
    /// Tokens to feed, starting at position `num_computed_tokens`.
    pub input_tokens: Vec<u32>,
    /// Tokens whose attention state is already cached.
    pub num_computed_tokens: usize,
    /// Tokens to sample. More than one only for the first step of a
    /// request with parallel samples: one token per sample.
    pub num_new_tokens: usize,
    pub is_prefill: bool,
}

impl BatchEntry {
    /// Positions written by this entry.
    pub fn write_range(&self) -> std::ops::Range<usize> {
        self.num_computed_tokens..self.num_computed_tokens + self.input_tokens.len()
    }
}

/// Everything the engine needs for one step.
///
/// Memory operations must be applied before the forward pass, in the order
/// swap-out, copy, swap-in. A block freed by a preemption in this step may
/// be the source of a copy and the target of a swap-in at the same time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    /// Scheduler step number.
    pub step: u64,
    pub entries: Vec<BatchEntry>,
    /// `(src, dst)` device block copies from copy-on-write.
    pub blocks_to_copy: Vec<(BlockId, BlockId)>,
    /// `(host, device)` copies for resumed swapped-out requests.
    pub blocks_to_swap_in: Vec<(BlockId, BlockId)>,
    /// `(device, host)` copies for requests preempted by swapping.
    pub blocks_to_swap_out: Vec<(BlockId, BlockId)>,
}

impl BatchDescriptor {
    /// True when there is neither compute nor memory work to do.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.blocks_to_copy.is_empty()
            && self.blocks_to_swap_in.is_empty()
            && self.blocks_to_swap_out.is_empty()
    }

    pub fn num_sequences(&self) -> usize {
        self.entries.len()
    }

    /// Tokens fed through the model this step.
    pub fn num_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.input_tokens.len()).sum()
    }

    pub fn num_prefills(&self) -> usize {
        self.entries.iter().filter(|e| e.is_prefill).count()
    }

    pub fn get(&self, seq_id: SequenceId) -> Option<&BatchEntry> {
        self.entries.iter().find(|e| e.seq_id == seq_id)
    }
}

/// Tokens produced for one sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceOutput {
    pub new_tokens: Vec<u32>,
    /// The engine considers the sample complete.
    pub done: bool,
}

impl SequenceOutput {
    pub fn new(new_tokens: Vec<u32>) -> Self {
        Self {
            new_tokens,
            done: false,
        }
    }

    pub fn done(mut self) -> Self {
        self.done = true;
        self
    }
}

/// Result of one step, keyed by sequence id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    outputs: HashMap<SequenceId, SequenceOutput>,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, seq_id: SequenceId, output: SequenceOutput) {
        self.outputs.insert(seq_id, output);
    }

    pub fn get(&self, seq_id: SequenceId) -> Option<&SequenceOutput> {
        self.outputs.get(&seq_id)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn seq_ids(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.outputs.keys().copied()
    }
}

impl FromIterator<(SequenceId, SequenceOutput)> for StepOutput {
    fn from_iter<I: IntoIterator<Item = (SequenceId, SequenceOutput)>>(iter: I) -> Self {
        Self {
            outputs: iter.into_iter().collect(),
        }
    }
}

/// Runs one batched step.
///
/// Any error fails every request in the batch.
pub trait ExecutionEngine {
    fn run_step(&mut self, batch: &BatchDescriptor) -> Result<StepOutput, EngineError>;
}

impl<E: ExecutionEngine + ?Sized> ExecutionEngine for Box<E> {
    fn run_step(&mut self, batch: &BatchDescriptor) -> Result<StepOutput, EngineError> {
        (**self).run_step(batch)
    }
}
