//! Integration tests for Block and BlockTable.

use inflight_batcher::core::block::{
    compute_num_blocks, hash_full_blocks, hash_token_block, Block, BlockTable,
};
use inflight_batcher::Error;

#[test]
fn test_block_creation() {
    let block = Block::new(42);
    assert_eq!(block.block_id(), 42);
    assert_eq!(block.ref_count(), 0);
    assert!(block.is_free());
    assert!(!block.is_shared());
    assert!(block.prefix_hash().is_none());
}

#[test]
fn test_block_table_basic() {
    let mut table = BlockTable::new(16);
    assert!(table.is_empty());
    assert_eq!(table.num_blocks(), 0);
    assert_eq!(table.last_block_id(), None);

    table.append_block(5);
    table.append_block(12);
    table.append_block(3);

    assert!(!table.is_empty());
    assert_eq!(table.num_blocks(), 3);
    assert_eq!(table.block_size(), 16);
    assert_eq!(table.get_physical_block_ids(), &[5, 12, 3]);
}

#[test]
fn test_block_table_get_block_id() {
    let mut table = BlockTable::new(16);
    table.append_block(5);
    table.append_block(12);

    assert_eq!(table.get_block_id(0).unwrap(), 5);
    assert_eq!(table.get_block_id(1).unwrap(), 12);
    assert!(matches!(
        table.get_block_id(2),
        Err(Error::BlockIndexOutOfBounds {
            logical_idx: 2,
            num_blocks: 2
        })
    ));
}

#[test]
fn test_block_table_capacity() {
    let mut table = BlockTable::new(4);
    assert_eq!(table.capacity(), 0);

    table.append_block(0);
    assert_eq!(table.capacity(), 4);

    table.append_block(1);
    assert_eq!(table.capacity(), 8);
}

#[test]
fn test_hash_chain_depends_on_prefix() {
    let a = [1u32, 2, 3, 4, 5, 6, 7, 8];
    let b = [9u32, 9, 9, 9, 5, 6, 7, 8];

    let ha = hash_full_blocks(&a, 4);
    let hb = hash_full_blocks(&b, 4);

    // Same tokens in the second block, different history
    assert_eq!(&a[4..], &b[4..]);
    assert_ne!(ha[1], hb[1]);
    assert_eq!(ha[0], hash_token_block(&a[..4], None));
}

#[test]
fn test_hash_is_deterministic() {
    let tokens = [3u32, 1, 4, 1, 5, 9, 2, 6];
    assert_eq!(hash_full_blocks(&tokens, 4), hash_full_blocks(&tokens, 4));
    assert!(hash_full_blocks(&tokens[..3], 4).is_empty());
}

#[test]
fn test_compute_num_blocks() {
    assert_eq!(compute_num_blocks(0, 16), 0);
    assert_eq!(compute_num_blocks(1, 16), 1);
    assert_eq!(compute_num_blocks(15, 16), 1);
    assert_eq!(compute_num_blocks(16, 16), 1);
    assert_eq!(compute_num_blocks(17, 16), 2);
    assert_eq!(compute_num_blocks(8, 4), 2);
    assert_eq!(compute_num_blocks(9, 4), 3);
}
