//! Sequence tracking for generation requests.
//!
//! A sequence is the token history of one sample of a request, together
//! with the block table holding its cached attention state.

use serde::{Deserialize, Serialize};

use crate::core::block::BlockTable;

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End-of-sequence token generated, or the engine flagged the sample done.
    EndOfSequence,
    /// `max_new_tokens` reached.
    MaxTokens,
    /// One of the stop token ids was generated.
    StopToken,
    /// The output ends with one of the stop token sequences.
    StopSequence,
}

/// One sample of a request.
///
/// # Example
///
/// ```
/// use inflight_batcher::core::sequence::Sequence;
///
/// let mut seq = Sequence::new(1, vec![1, 2, 3, 4], 16);
/// assert_eq!(seq.prompt_len(), 4);
/// assert_eq!(seq.output_len(), 0);
///
/// seq.append_token(5);
/// assert_eq!(seq.output_len(), 1);
/// assert_eq!(seq.total_len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    seq_id: SequenceId,
    prompt_token_ids: Vec<u32>,
    output_token_ids: Vec<u32>,
    /// Device block table.
    block_table: BlockTable,
    /// Host block table while swapped out.
    host_table: BlockTable,
    /// Tokens whose attention state is in the cache.
    num_computed_tokens: usize,
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    /// Create a new sequence with the given prompt tokens.
    pub fn new(seq_id: SequenceId, prompt_token_ids: Vec<u32>, block_size: usize) -> Self {
        Self {
            seq_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            block_table: BlockTable::new(block_size),
            host_table: BlockTable::new(block_size),
            num_computed_tokens: 0,
            finish_reason: None,
        }
    }

    /// Create a sibling sample with the same history and no blocks.
    ///
    /// The caller is responsible for giving it a forked block table.
    pub(crate) fn fork_history(&self, seq_id: SequenceId) -> Self {
        let block_size = self.block_table.block_size();
        Self {
            seq_id,
            prompt_token_ids: self.prompt_token_ids.clone(),
            output_token_ids: self.output_token_ids.clone(),
            block_table: BlockTable::new(block_size),
            host_table: BlockTable::new(block_size),
            num_computed_tokens: self.num_computed_tokens,
            finish_reason: None,
        }
    }

    // ========== Getters ==========

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Get the output token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    /// Tokens from position `num_computed_tokens` on.
    pub fn uncomputed_token_ids(&self) -> Vec<u32> {
        self.prompt_token_ids
            .iter()
            .chain(&self.output_token_ids)
            .skip(self.num_computed_tokens)
            .copied()
            .collect()
    }

    /// Get the device block table.
    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    /// Get mutable access to the device block table.
    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    /// Get the host block table.
    pub fn host_table(&self) -> &BlockTable {
        &self.host_table
    }

    pub(crate) fn host_table_mut(&mut self) -> &mut BlockTable {
        &mut self.host_table
    }

    /// Tokens whose attention state is already cached.
    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    // ========== Length queries ==========

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Tokens still to be written into the cache.
    pub fn num_uncomputed_tokens(&self) -> usize {
        self.total_len() - self.num_computed_tokens
    }

    // ========== Token operations ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    /// Whether the output currently ends with `stop`.
    pub fn output_ends_with(&self, stop: &[u32]) -> bool {
        !stop.is_empty() && self.output_token_ids.ends_with(stop)
    }

    /// Record that `num_tokens` tokens have cached state.
    pub fn set_num_computed_tokens(&mut self, num_tokens: usize) {
        self.num_computed_tokens = num_tokens.min(self.total_len());
    }

    /// Forget the cached state; the history stays.
    pub(crate) fn reset_computed(&mut self) {
        self.num_computed_tokens = 0;
    }

    /// Mark the sequence as finished.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.finish_reason = Some(reason);
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}

impl std::hash::Hash for Sequence {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.seq_id.hash(state);
    }
}
