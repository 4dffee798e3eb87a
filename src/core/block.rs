//! Blocks and block tables for the paged KV cache.
//!
//! The cache is divided into fixed-size blocks, similar to how an operating
//! system manages physical memory with pages. A sequence never owns
//! contiguous memory; it owns a [`BlockTable`] of block handles.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Handle of a physical block in a [`BlockPool`](super::block_pool::BlockPool).
pub type BlockId = usize;

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// The hash includes the parent block's hash, so blocks holding the same
/// tokens behind different prefixes hash differently.
///
/// # Example
///
/// ```
/// use inflight_batcher::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();

    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }
    for &token in token_ids {
        token.hash(&mut hasher);
    }

    hasher.finish()
}

/// Chained hashes of every full block of `token_ids`.
pub fn hash_full_blocks(token_ids: &[u32], block_size: usize) -> Vec<u64> {
    let mut hashes = Vec::with_capacity(token_ids.len() / block_size);
    let mut parent = None;
    for chunk in token_ids.chunks_exact(block_size) {
        let hash = hash_token_block(chunk, parent);
        hashes.push(hash);
        parent = Some(hash);
    }
    hashes
}

/// One slot of the block arena.
///
/// A block is free iff its reference count is zero.
#[derive(Debug, Clone)]
pub struct Block {
    block_id: BlockId,
    ref_count: usize,
    /// Chained hash of the tokens held, when registered in the prefix cache.
    prefix_hash: Option<u64>,
}

impl Block {
    /// Create a free block.
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            ref_count: 0,
            prefix_hash: None,
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Whether the block sits in the free set.
    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }

    /// Whether more than one table references the block.
    pub fn is_shared(&self) -> bool {
        self.ref_count > 1
    }

    /// Get the prefix hash.
    pub fn prefix_hash(&self) -> Option<u64> {
        self.prefix_hash
    }

    pub(crate) fn set_prefix_hash(&mut self, hash: Option<u64>) {
        self.prefix_hash = hash;
    }

    pub(crate) fn increment_ref(&mut self) -> usize {
        self.ref_count += 1;
        self.ref_count
    }

    /// Decrement the reference count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBlock`] if the block is already free.
    pub(crate) fn decrement_ref(&mut self) -> Result<usize> {
        if self.ref_count == 0 {
            return Err(Error::InvalidBlock(self.block_id));
        }
        self.ref_count -= 1;
        Ok(self.ref_count)
    }
}

/// Maps a sequence's logical positions to physical block IDs.
///
/// Think of this like a page table in virtual memory. Token at position `p`
/// is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// # Example
///
/// ```
/// use inflight_batcher::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
/// table.append_block(3);   // Tokens 32-47
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// assert_eq!(table.capacity(), 48);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    block_ids: Vec<BlockId>,
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    pub(crate) fn from_blocks(block_size: usize, block_ids: Vec<BlockId>) -> Self {
        Self {
            block_ids,
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if the logical block index
    /// is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<BlockId> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: logical_block_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Add a new physical block to the end of the table.
    pub fn append_block(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
    }

    /// Replace the last block, returning the old handle.
    pub(crate) fn replace_last(&mut self, block_id: BlockId) -> Option<BlockId> {
        self.block_ids
            .last_mut()
            .map(|last| std::mem::replace(last, block_id))
    }

    /// Number of blocks in the table.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Number of token slots the table can hold.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Last block handle, if any.
    pub fn last_block_id(&self) -> Option<BlockId> {
        self.block_ids.last().copied()
    }

    /// Get all physical block IDs in logical order.
    pub fn get_physical_block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Take every handle out of the table, leaving it empty.
    pub(crate) fn take_blocks(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.block_ids)
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use inflight_batcher::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);
/// assert_eq!(compute_num_blocks(32, 16), 2);
/// assert_eq!(compute_num_blocks(0, 16), 0);
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_starts_free() {
        let block = Block::new(42);
        assert_eq!(block.block_id(), 42);
        assert_eq!(block.ref_count(), 0);
        assert!(block.is_free());
        assert!(block.prefix_hash().is_none());
    }

    #[test]
    fn test_block_ref_counting() {
        let mut block = Block::new(0);
        assert_eq!(block.increment_ref(), 1);
        assert_eq!(block.increment_ref(), 2);
        assert!(block.is_shared());

        assert_eq!(block.decrement_ref().unwrap(), 1);
        assert_eq!(block.decrement_ref().unwrap(), 0);
        assert!(block.is_free());

        // Underflow is a programming error, not a silent saturation
        assert!(matches!(block.decrement_ref(), Err(Error::InvalidBlock(0))));
    }

    #[test]
    fn test_block_table_basic() {
        let mut table = BlockTable::new(16);
        assert!(table.is_empty());

        table.append_block(5);
        table.append_block(12);
        table.append_block(3);

        assert_eq!(table.num_blocks(), 3);
        assert_eq!(table.capacity(), 48);
        assert_eq!(table.get_physical_block_ids(), &[5, 12, 3]);
        assert_eq!(table.last_block_id(), Some(3));
        assert!(table.get_block_id(3).is_err());
    }

    #[test]
    fn test_replace_last_and_take() {
        let mut table = BlockTable::from_blocks(4, vec![1, 2]);
        assert_eq!(table.replace_last(9), Some(2));
        assert_eq!(table.get_physical_block_ids(), &[1, 9]);

        assert_eq!(table.take_blocks(), vec![1, 9]);
        assert!(table.is_empty());
        assert!(table.take_blocks().is_empty());
    }

    #[test]
    fn test_hash_full_blocks_ignores_partial_tail() {
        let tokens = [1u32, 2, 3, 4, 5, 6, 7, 8, 9];
        let hashes = hash_full_blocks(&tokens, 4);
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], hash_token_block(&tokens[..4], None));
        assert_eq!(hashes[1], hash_token_block(&tokens[4..8], Some(hashes[0])));
    }

    #[test]
    fn test_compute_num_blocks() {
        assert_eq!(compute_num_blocks(0, 16), 0);
        assert_eq!(compute_num_blocks(1, 16), 1);
        assert_eq!(compute_num_blocks(16, 16), 1);
        assert_eq!(compute_num_blocks(17, 16), 2);
        assert_eq!(compute_num_blocks(36, 4), 9);
    }
}
