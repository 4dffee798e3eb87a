//! Integration tests for BlockPool.

use inflight_batcher::core::block::{hash_full_blocks, BlockTable};
use inflight_batcher::core::block_pool::BlockPool;
use inflight_batcher::Error;
use proptest::prelude::*;

fn assert_conserved(pool: &BlockPool, tables: &[BlockTable]) {
    assert_eq!(pool.free_count() + pool.num_used_blocks(), pool.capacity());
    let held: usize = tables.iter().map(BlockTable::num_blocks).sum();
    assert_eq!(held, pool.total_ref_count());
}

#[test]
fn test_allocate_and_free() {
    let mut pool = BlockPool::new(10, 16);

    let blocks = pool.allocate(1).unwrap();
    assert_eq!(pool.free_count(), 9);
    assert_eq!(pool.num_used_blocks(), 1);
    assert_eq!(pool.ref_count(blocks[0]), Some(1));

    assert!(pool.free(blocks[0]).unwrap());
    assert_eq!(pool.free_count(), 10);
    assert_eq!(pool.ref_count(blocks[0]), Some(0));
}

#[test]
fn test_allocate_zero() {
    let mut pool = BlockPool::new(2, 16);
    assert!(pool.allocate(0).unwrap().is_empty());
    assert_eq!(pool.free_count(), 2);
}

#[test]
fn test_failed_allocation_changes_nothing() {
    let mut pool = BlockPool::new(4, 16);
    let held = pool.allocate(3).unwrap();

    assert!(matches!(
        pool.allocate(2),
        Err(Error::OutOfBlocks {
            requested: 2,
            available: 1
        })
    ));
    assert_eq!(pool.free_count(), 1);
    for id in held {
        assert_eq!(pool.ref_count(id), Some(1));
    }
}

#[test]
fn test_handles_are_distinct() {
    let mut pool = BlockPool::new(8, 4);
    let mut blocks = pool.allocate(8).unwrap();
    blocks.sort_unstable();
    blocks.dedup();
    assert_eq!(blocks.len(), 8);
    assert!(blocks.iter().all(|&id| id < 8));
}

#[test]
fn test_shared_prefix_survives_one_owner() {
    let mut pool = BlockPool::new(10, 4);

    // Two sequences share a two-block prefix.
    let mut first = pool.allocate_table(2).unwrap();
    let mut second = pool.fork(&first).unwrap();
    let prefix = first.get_physical_block_ids().to_vec();
    for &id in &prefix {
        assert_eq!(pool.ref_count(id), Some(2));
    }

    assert_eq!(pool.release(&mut first).unwrap(), 0);
    for &id in &prefix {
        assert_eq!(pool.ref_count(id), Some(1));
    }
    assert_eq!(pool.free_count(), 8);

    assert_eq!(pool.release(&mut second).unwrap(), 2);
    assert_eq!(pool.free_count(), 10);
}

#[test]
fn test_copy_on_write_private_tail_is_noop() {
    let mut pool = BlockPool::new(4, 4);
    let mut table = pool.allocate_table(2).unwrap();
    assert!(pool.copy_on_write(&mut table).unwrap().is_none());

    let mut empty = BlockTable::new(4);
    assert!(pool.copy_on_write(&mut empty).unwrap().is_none());
}

#[test]
fn test_copy_on_write_out_of_blocks() {
    let mut pool = BlockPool::new(2, 4);
    let parent = pool.allocate_table(1).unwrap();
    let mut child = pool.fork(&parent).unwrap();
    let _filler = pool.allocate(1).unwrap();

    assert!(matches!(
        pool.copy_on_write(&mut child),
        Err(Error::OutOfBlocks { .. })
    ));
    // Still shared, untouched
    assert_eq!(child, parent);
    assert_eq!(pool.ref_count(parent.get_physical_block_ids()[0]), Some(2));
}

#[test]
fn test_prefix_match_stops_at_first_miss() {
    let mut pool = BlockPool::new(8, 4);
    let tokens: Vec<u32> = (0..12).collect();
    let hashes = hash_full_blocks(&tokens, 4);

    let table = pool.allocate_table(3).unwrap();
    pool.cache_block(table.get_block_id(0).unwrap(), hashes[0]);
    pool.cache_block(table.get_block_id(2).unwrap(), hashes[2]);

    assert_eq!(pool.count_prefix_hits(&hashes), 1);
    let hits = pool.match_prefix(&hashes);
    assert_eq!(hits, vec![table.get_block_id(0).unwrap()]);
    assert_eq!(pool.ref_count(hits[0]), Some(2));
}

#[test]
fn test_freed_block_leaves_prefix_cache() {
    let mut pool = BlockPool::new(4, 4);
    let hashes = hash_full_blocks(&[1, 2, 3, 4], 4);

    let mut table = pool.allocate_table(1).unwrap();
    pool.cache_block(table.get_block_id(0).unwrap(), hashes[0]);
    pool.release(&mut table).unwrap();

    assert!(!pool.is_prefix_cached(hashes[0]));
    assert!(pool.match_prefix(&hashes).is_empty());
    assert_eq!(pool.free_count(), 4);
}

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize),
    Fork(usize),
    CopyOnWrite(usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..4).prop_map(Op::Allocate),
        any::<usize>().prop_map(Op::Fork),
        any::<usize>().prop_map(Op::CopyOnWrite),
        any::<usize>().prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn test_pool_conserves_blocks(ops in prop::collection::vec(op(), 1..64)) {
        let mut pool = BlockPool::new(16, 4);
        let mut tables: Vec<BlockTable> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(n) => {
                    if let Ok(table) = pool.allocate_table(n) {
                        tables.push(table);
                    }
                }
                Op::Fork(i) if !tables.is_empty() => {
                    let idx = i % tables.len();
                    let child = pool.fork(&tables[idx]).unwrap();
                    tables.push(child);
                }
                Op::CopyOnWrite(i) if !tables.is_empty() => {
                    let idx = i % tables.len();
                    let _ = pool.copy_on_write(&mut tables[idx]);
                }
                Op::Release(i) if !tables.is_empty() => {
                    let mut table = tables.swap_remove(i % tables.len());
                    pool.release(&mut table).unwrap();
                }
                _ => {}
            }
            assert_conserved(&pool, &tables);
        }

        for mut table in tables.drain(..) {
            pool.release(&mut table).unwrap();
        }
        prop_assert_eq!(pool.free_count(), 16);
        prop_assert_eq!(pool.total_ref_count(), 0);
    }
}
