//! Synthetic execution engine.
//!
//! Stands in for a model when driving the scheduler from tests and the
//! simulator. It performs no numerical work: it checks each batch against
//! the paged cache rules and answers with pseudo-random tokens.
//!
//! Checks per batch:
//! - every block handle is inside its pool
//! - every table covers the positions its entry writes
//! - no block is written by two sequences in the same step

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use super::executor::{BatchDescriptor, ExecutionEngine, SequenceOutput, StepOutput};
use crate::config::EngineConfig;
use crate::core::block::BlockId;
use crate::core::sequence::SequenceId;
use crate::error::EngineError;

/// Seeded stand-in for a model.
///
/// # Example
///
/// ```
/// use inflight_batcher::config::EngineConfig;
/// use inflight_batcher::engine::SyntheticEngine;
///
/// let engine = SyntheticEngine::new(&EngineConfig::default(), 42)
///     .with_vocab_size(1000)
///     .fail_at_step(7);
/// assert_eq!(engine.steps(), 0);
/// ```
#[derive(Debug)]
pub struct SyntheticEngine {
    rng: StdRng,
    block_size: usize,
    num_blocks: usize,
    num_host_blocks: usize,
    vocab_size: u32,
    eos_token_id: Option<u32>,
    eos_probability: f64,
    fail_at_step: Option<u64>,
    steps: u64,
    tokens_processed: u64,
}

impl SyntheticEngine {
    /// Create an engine matching the cache layout of `config`.
    pub fn new(config: &EngineConfig, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            block_size: config.cache.block_size,
            num_blocks: config.cache.num_blocks,
            num_host_blocks: config.cache.num_host_blocks,
            vocab_size: 32_000,
            eos_token_id: config.eos_token_id,
            eos_probability: 0.0,
            fail_at_step: None,
            steps: 0,
            tokens_processed: 0,
        }
    }

    /// Draw tokens from `0..vocab_size`.
    pub fn with_vocab_size(mut self, vocab_size: u32) -> Self {
        self.vocab_size = vocab_size.max(2);
        self
    }

    /// Emit the EOS token with this probability per sampled token.
    ///
    /// Has no effect unless the configuration names an EOS token.
    pub fn with_eos_probability(mut self, probability: f64) -> Self {
        self.eos_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Fail the batch whose step number is `step`.
    pub fn fail_at_step(mut self, step: u64) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// Batches executed, including failed ones.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Input tokens fed through the engine so far.
    pub fn tokens_processed(&self) -> u64 {
        self.tokens_processed
    }

    /// Check a batch without executing it.
    pub fn validate(&self, batch: &BatchDescriptor) -> Result<(), EngineError> {
        let mut writers: HashMap<BlockId, SequenceId> = HashMap::new();

        for entry in &batch.entries {
            if entry.input_tokens.is_empty() || entry.num_new_tokens == 0 {
                return Err(EngineError::InvalidBatch(format!(
                    "sequence {} has nothing to do",
                    entry.seq_id
                )));
            }
            if let Some(&bad) = entry.block_ids.iter().find(|&&id| id >= self.num_blocks) {
                return Err(EngineError::InvalidBatch(format!(
                    "sequence {} references block {bad} outside the pool",
                    entry.seq_id
                )));
            }

            let range = entry.write_range();
            let capacity = entry.block_ids.len() * self.block_size;
            if capacity < range.end {
                return Err(EngineError::InvalidBatch(format!(
                    "sequence {} writes {} tokens into {capacity} slots",
                    entry.seq_id, range.end
                )));
            }

            let first = range.start / self.block_size;
            let last = (range.end - 1) / self.block_size;
            for &block_id in &entry.block_ids[first..=last] {
                if let Some(&other) = writers.get(&block_id) {
                    if other != entry.seq_id {
                        return Err(EngineError::InvalidBatch(format!(
                            "block {block_id} written by sequences {other} and {}",
                            entry.seq_id
                        )));
                    }
                }
                writers.insert(block_id, entry.seq_id);
            }
        }

        let device_ok = |id: BlockId| id < self.num_blocks;
        let host_ok = |id: BlockId| id < self.num_host_blocks;
        let copies_ok = batch
            .blocks_to_copy
            .iter()
            .all(|&(src, dst)| device_ok(src) && device_ok(dst));
        let swap_in_ok = batch
            .blocks_to_swap_in
            .iter()
            .all(|&(host, device)| host_ok(host) && device_ok(device));
        let swap_out_ok = batch
            .blocks_to_swap_out
            .iter()
            .all(|&(device, host)| device_ok(device) && host_ok(host));
        if !(copies_ok && swap_in_ok && swap_out_ok) {
            return Err(EngineError::InvalidBatch(
                "memory operation references a block outside its pool".to_string(),
            ));
        }
        Ok(())
    }

    fn sample(&mut self) -> u32 {
        if let Some(eos) = self.eos_token_id {
            if self.eos_probability > 0.0 && self.rng.gen_bool(self.eos_probability) {
                return eos;
            }
            let token = self.rng.gen_range(0..self.vocab_size);
            if token == eos {
                return (token + 1) % self.vocab_size;
            }
            return token;
        }
        self.rng.gen_range(0..self.vocab_size)
    }
}

impl ExecutionEngine for SyntheticEngine {
    fn run_step(&mut self, batch: &BatchDescriptor) -> Result<StepOutput, EngineError> {
        self.steps += 1;
        if self.fail_at_step == Some(batch.step) {
            return Err(EngineError::StepFailed(format!(
                "injected failure at step {}",
                batch.step
            )));
        }
        self.validate(batch)?;

        let mut output = StepOutput::new();
        for entry in &batch.entries {
            self.tokens_processed += entry.input_tokens.len() as u64;
            let tokens = (0..entry.num_new_tokens).map(|_| self.sample()).collect();
            output.insert(entry.seq_id, SequenceOutput::new(tokens));
        }
        trace!(
            step = batch.step,
            num_seqs = batch.num_sequences(),
            copies = batch.blocks_to_copy.len(),
            "synthetic step"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::BatchEntry;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.cache.block_size = 4;
        config.cache.num_blocks = 8;
        config
    }

    fn entry(seq_id: SequenceId, block_ids: Vec<BlockId>, computed: usize, input: usize) -> BatchEntry {
        BatchEntry {
            request_id: seq_id,
            seq_id,
            block_ids,
            input_tokens: vec![1; input],
            num_computed_tokens: computed,
            num_new_tokens: 1,
            is_prefill: computed == 0,
        }
    }

    #[test]
    fn test_answers_every_entry() {
        let mut engine = SyntheticEngine::new(&config(), 1);
        let batch = BatchDescriptor {
            entries: vec![entry(1, vec![0, 1], 0, 6), entry(2, vec![2], 2, 1)],
            ..BatchDescriptor::default()
        };

        let output = engine.run_step(&batch).unwrap();
        assert_eq!(output.len(), 2);
        assert_eq!(output.get(1).unwrap().new_tokens.len(), 1);
        assert_eq!(engine.tokens_processed(), 7);
    }

    #[test]
    fn test_rejects_short_table() {
        let engine = SyntheticEngine::new(&config(), 1);
        let batch = BatchDescriptor {
            entries: vec![entry(1, vec![0], 0, 5)],
            ..BatchDescriptor::default()
        };
        assert!(matches!(
            engine.validate(&batch),
            Err(EngineError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_rejects_shared_write() {
        let engine = SyntheticEngine::new(&config(), 1);
        // Both sequences write position 5, inside shared block 1
        let batch = BatchDescriptor {
            entries: vec![entry(1, vec![0, 1], 5, 1), entry(2, vec![0, 1], 5, 1)],
            ..BatchDescriptor::default()
        };
        assert!(engine.validate(&batch).is_err());

        // Reading a shared block is fine
        let batch = BatchDescriptor {
            entries: vec![entry(1, vec![0, 1], 5, 1), entry(2, vec![0, 2], 5, 1)],
            ..BatchDescriptor::default()
        };
        assert!(engine.validate(&batch).is_ok());
    }

    #[test]
    fn test_injected_failure() {
        let mut engine = SyntheticEngine::new(&config(), 1).fail_at_step(3);
        let batch = BatchDescriptor {
            step: 3,
            entries: vec![entry(1, vec![0], 0, 2)],
            ..BatchDescriptor::default()
        };
        assert!(matches!(
            engine.run_step(&batch),
            Err(EngineError::StepFailed(_))
        ));
        assert_eq!(engine.steps(), 1);
    }

    #[test]
    fn test_seeded_output_is_reproducible() {
        let batch = BatchDescriptor {
            entries: vec![entry(1, vec![0], 0, 2)],
            ..BatchDescriptor::default()
        };
        let mut a = SyntheticEngine::new(&config(), 7);
        let mut b = SyntheticEngine::new(&config(), 7);
        for _ in 0..5 {
            assert_eq!(a.run_step(&batch).unwrap(), b.run_step(&batch).unwrap());
        }
    }

    #[test]
    fn test_eos_probability_one() {
        let mut config = config();
        config.eos_token_id = Some(0);
        let mut engine = SyntheticEngine::new(&config, 3).with_eos_probability(1.0);
        let batch = BatchDescriptor {
            entries: vec![entry(1, vec![0], 0, 2)],
            ..BatchDescriptor::default()
        };
        let output = engine.run_step(&batch).unwrap();
        assert_eq!(output.get(1).unwrap().new_tokens, vec![0]);
    }
}
