//! Reference-counted block pool for the paged KV cache.
//!
//! The pool owns a fixed arena of `C` blocks indexed by handle, a free list,
//! and an optional prefix cache. Ownership is explicit: allocation sets a
//! block's count to one, [`share`](BlockPool::share) and
//! [`fork`](BlockPool::fork) increment it, [`free`](BlockPool::free) and
//! [`release`](BlockPool::release) decrement it. A block returns to the free
//! list exactly when its count reaches zero.
//!
//! ## Example
//!
//! ```
//! use inflight_batcher::core::block_pool::BlockPool;
//!
//! let mut pool = BlockPool::new(10, 4);
//!
//! let blocks = pool.allocate(2).unwrap();
//! pool.share(blocks[0]).unwrap();
//! assert_eq!(pool.free_count(), 8);
//!
//! assert!(!pool.free(blocks[0]).unwrap()); // still referenced
//! assert!(pool.free(blocks[0]).unwrap());
//! assert!(pool.free(blocks[1]).unwrap());
//! assert_eq!(pool.free_count(), 10);
//! ```

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::core::block::{Block, BlockId, BlockTable};
use crate::error::{Error, Result};

/// Fixed-capacity arena of reference-counted blocks.
#[derive(Debug)]
pub struct BlockPool {
    /// All blocks indexed by block_id.
    blocks: Vec<Block>,
    /// Free block IDs.
    free_list: VecDeque<BlockId>,
    /// Prefix hash -> block_id mapping for prefix caching.
    prefix_cache: HashMap<u64, BlockId>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockPool {
    /// Create a pool of `num_blocks` free blocks holding `block_size`
    /// tokens each.
    ///
    /// ```
    /// use inflight_batcher::core::block_pool::BlockPool;
    ///
    /// let pool = BlockPool::new(1024, 16);
    /// assert_eq!(pool.free_count(), 1024);
    /// ```
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            blocks: (0..num_blocks).map(Block::new).collect(),
            free_list: (0..num_blocks).collect(),
            prefix_cache: HashMap::new(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks (`C`).
    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks in the free set.
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Number of blocks with a non-zero reference count.
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| !b.is_free()).count()
    }

    /// Sum of all reference counts.
    pub fn total_ref_count(&self) -> usize {
        self.blocks.iter().map(Block::ref_count).sum()
    }

    /// Check if `num_blocks` blocks can be allocated right now.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Get a block by handle.
    pub fn get_block(&self, block_id: BlockId) -> Option<&Block> {
        self.blocks.get(block_id)
    }

    /// Reference count of a block, or `None` for an unknown handle.
    pub fn ref_count(&self, block_id: BlockId) -> Option<usize> {
        self.blocks.get(block_id).map(Block::ref_count)
    }

    /// Allocate `num_blocks` blocks, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if fewer than `num_blocks` blocks are
    /// free; the pool is left untouched.
    ///
    /// ```
    /// use inflight_batcher::core::block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::new(2, 16);
    /// assert!(pool.allocate(3).is_err());
    /// assert_eq!(pool.free_count(), 2);
    /// ```
    pub fn allocate(&mut self, num_blocks: usize) -> Result<Vec<BlockId>> {
        if !self.can_allocate(num_blocks) {
            return Err(Error::OutOfBlocks {
                requested: num_blocks,
                available: self.free_list.len(),
            });
        }

        let block_ids: Vec<BlockId> = self.free_list.drain(..num_blocks).collect();
        for &block_id in &block_ids {
            self.blocks[block_id].increment_ref();
        }
        trace!(num_blocks, free = self.free_list.len(), "allocated blocks");
        Ok(block_ids)
    }

    /// Allocate a table holding `num_blocks` fresh blocks.
    pub fn allocate_table(&mut self, num_blocks: usize) -> Result<BlockTable> {
        let block_ids = self.allocate(num_blocks)?;
        Ok(BlockTable::from_blocks(self.block_size, block_ids))
    }

    /// Drop one reference to a block.
    ///
    /// # Returns
    ///
    /// `true` if the block went back to the free set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBlock`] for an unknown or already free handle.
    pub fn free(&mut self, block_id: BlockId) -> Result<bool> {
        let block = self
            .blocks
            .get_mut(block_id)
            .ok_or(Error::InvalidBlock(block_id))?;

        if block.decrement_ref()? > 0 {
            return Ok(false);
        }

        if let Some(hash) = block.prefix_hash() {
            if self.prefix_cache.get(&hash) == Some(&block_id) {
                self.prefix_cache.remove(&hash);
            }
            block.set_prefix_hash(None);
        }
        self.free_list.push_back(block_id);
        Ok(true)
    }

    /// Release every block of a table and leave the table empty.
    ///
    /// Releasing the same table twice frees nothing the second time.
    ///
    /// # Returns
    ///
    /// Number of blocks that went back to the free set.
    pub fn release(&mut self, table: &mut BlockTable) -> Result<usize> {
        let mut freed = 0;
        for block_id in table.take_blocks() {
            if self.free(block_id)? {
                freed += 1;
            }
        }
        Ok(freed)
    }

    /// Add one reference to an allocated block.
    ///
    /// # Returns
    ///
    /// The new reference count.
    pub fn share(&mut self, block_id: BlockId) -> Result<usize> {
        match self.blocks.get_mut(block_id) {
            Some(block) if !block.is_free() => Ok(block.increment_ref()),
            _ => Err(Error::InvalidBlock(block_id)),
        }
    }

    /// Create a new table referencing the same blocks as `table`.
    ///
    /// Every block gains one reference. The first write into a shared tail
    /// block must go through [`copy_on_write`](Self::copy_on_write).
    pub fn fork(&mut self, table: &BlockTable) -> Result<BlockTable> {
        for &block_id in table.get_physical_block_ids() {
            self.share(block_id)?;
        }
        Ok(table.clone())
    }

    /// Give `table` a private tail block if its tail is shared.
    ///
    /// # Returns
    ///
    /// `Some((src, dst))` when a copy was made; the contents of `src` must be
    /// copied to `dst` before the next write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if no block is free; the table is
    /// left untouched.
    pub fn copy_on_write(&mut self, table: &mut BlockTable) -> Result<Option<(BlockId, BlockId)>> {
        let Some(last) = table.last_block_id() else {
            return Ok(None);
        };
        if !self.blocks[last].is_shared() {
            return Ok(None);
        }

        let fresh = self.allocate(1)?[0];
        table.replace_last(fresh);
        self.free(last)?;
        trace!(src = last, dst = fresh, "copy-on-write");
        Ok(Some((last, fresh)))
    }

    /// Number of blocks that would return to the free set if every table in
    /// `tables` were released.
    ///
    /// A shared block only counts when all its references are held by the
    /// given tables.
    pub fn reclaimable<'a>(&self, tables: impl IntoIterator<Item = &'a BlockTable>) -> usize {
        let mut held: HashMap<BlockId, usize> = HashMap::new();
        for table in tables {
            for &block_id in table.get_physical_block_ids() {
                *held.entry(block_id).or_default() += 1;
            }
        }
        held.iter()
            .filter(|&(block_id, refs)| self.ref_count(*block_id) == Some(*refs))
            .count()
    }

    // ========== Prefix Caching ==========

    /// Register an allocated block under a prefix hash.
    pub fn cache_block(&mut self, block_id: BlockId, prefix_hash: u64) {
        if let Some(block) = self.blocks.get_mut(block_id) {
            if !block.is_free() {
                block.set_prefix_hash(Some(prefix_hash));
                self.prefix_cache.insert(prefix_hash, block_id);
            }
        }
    }

    /// Share the longest run of cached blocks matching `hashes`.
    ///
    /// Stops at the first miss. Every returned block gained one reference.
    pub fn match_prefix(&mut self, hashes: &[u64]) -> Vec<BlockId> {
        let mut hits = Vec::new();
        for hash in hashes {
            let Some(&block_id) = self.prefix_cache.get(hash) else {
                break;
            };
            if self.blocks[block_id].is_free() {
                self.prefix_cache.remove(hash);
                break;
            }
            self.blocks[block_id].increment_ref();
            hits.push(block_id);
        }
        hits
    }

    /// Number of leading `hashes` currently cached, without sharing them.
    pub fn count_prefix_hits(&self, hashes: &[u64]) -> usize {
        hashes
            .iter()
            .take_while(|hash| {
                self.prefix_cache
                    .get(hash)
                    .is_some_and(|&id| !self.blocks[id].is_free())
            })
            .count()
    }

    /// Check if a prefix hash is in the cache.
    pub fn is_prefix_cached(&self, prefix_hash: u64) -> bool {
        self.prefix_cache.contains_key(&prefix_hash)
    }

    /// Get the number of cached prefixes.
    pub fn num_cached_prefixes(&self) -> usize {
        self.prefix_cache.len()
    }

    /// Reset the pool: every block free, prefix cache empty.
    pub fn reset(&mut self) {
        let num_blocks = self.blocks.len();
        self.blocks = (0..num_blocks).map(Block::new).collect();
        self.prefix_cache.clear();
        self.free_list.clear();
        self.free_list.extend(0..num_blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::hash_token_block;

    #[test]
    fn test_pool_creation() {
        let pool = BlockPool::new(100, 16);
        assert_eq!(pool.capacity(), 100);
        assert_eq!(pool.block_size(), 16);
        assert_eq!(pool.free_count(), 100);
        assert_eq!(pool.num_used_blocks(), 0);
    }

    #[test]
    fn test_allocate_is_all_or_nothing() {
        let mut pool = BlockPool::new(5, 16);
        let blocks = pool.allocate(3).unwrap();
        assert_eq!(blocks.len(), 3);

        let err = pool.allocate(3).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfBlocks {
                requested: 3,
                available: 2
            }
        ));
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.num_used_blocks(), 3);
    }

    #[test]
    fn test_double_free_is_an_error() {
        let mut pool = BlockPool::new(4, 16);
        let block = pool.allocate(1).unwrap()[0];

        assert!(pool.free(block).unwrap());
        assert!(matches!(pool.free(block), Err(Error::InvalidBlock(_))));
        assert!(matches!(pool.free(99), Err(Error::InvalidBlock(99))));
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_share_requires_allocated_block() {
        let mut pool = BlockPool::new(4, 16);
        assert!(pool.share(0).is_err());

        let block = pool.allocate(1).unwrap()[0];
        assert_eq!(pool.share(block).unwrap(), 2);
    }

    #[test]
    fn test_release_is_idempotent_per_table() {
        let mut pool = BlockPool::new(8, 4);
        let mut table = pool.allocate_table(3).unwrap();

        assert_eq!(pool.release(&mut table).unwrap(), 3);
        assert_eq!(pool.release(&mut table).unwrap(), 0);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_fork_and_copy_on_write() {
        let mut pool = BlockPool::new(8, 4);
        let mut parent = pool.allocate_table(2).unwrap();
        let mut child = pool.fork(&parent).unwrap();

        let tail = parent.last_block_id().unwrap();
        assert_eq!(pool.ref_count(tail), Some(2));
        assert_eq!(pool.free_count(), 6);

        let (src, dst) = pool.copy_on_write(&mut child).unwrap().unwrap();
        assert_eq!(src, tail);
        assert_ne!(dst, tail);
        assert_eq!(pool.ref_count(tail), Some(1));
        assert_eq!(child.last_block_id(), Some(dst));
        assert_eq!(pool.free_count(), 5);

        // Parent's tail is private again
        assert!(pool.copy_on_write(&mut parent).unwrap().is_none());
    }

    #[test]
    fn test_reclaimable_accounts_for_sharing() {
        let mut pool = BlockPool::new(10, 4);
        let a = pool.allocate_table(2).unwrap();
        let b = pool.fork(&a).unwrap();

        assert_eq!(pool.reclaimable([&a]), 0);
        assert_eq!(pool.reclaimable([&a, &b]), 2);
    }

    #[test]
    fn test_prefix_cache_reuse_and_cleanup() {
        let mut pool = BlockPool::new(10, 4);
        let hash = hash_token_block(&[1, 2, 3, 4], None);

        let mut table = pool.allocate_table(1).unwrap();
        let block = table.last_block_id().unwrap();
        pool.cache_block(block, hash);
        assert!(pool.is_prefix_cached(hash));
        assert_eq!(pool.count_prefix_hits(&[hash, 7]), 1);

        let hits = pool.match_prefix(&[hash]);
        assert_eq!(hits, vec![block]);
        assert_eq!(pool.ref_count(block), Some(2));

        pool.release(&mut table).unwrap();
        assert!(pool.is_prefix_cached(hash));
        pool.free(block).unwrap();
        assert!(!pool.is_prefix_cached(hash));
        assert_eq!(pool.num_cached_prefixes(), 0);
    }

    #[test]
    fn test_reset() {
        let mut pool = BlockPool::new(10, 16);
        let blocks = pool.allocate(5).unwrap();
        pool.cache_block(blocks[0], 42);

        pool.reset();

        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.num_used_blocks(), 0);
        assert_eq!(pool.num_cached_prefixes(), 0);
    }
}
