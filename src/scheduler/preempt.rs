//! Preemption and recovery.
//!
//! A victim gives back every device block it holds. Under
//! [`PreemptionMode::Recompute`](crate::config::PreemptionMode::Recompute)
//! the cached state is simply forgotten and rebuilt by a prefill of the
//! whole history. Under swap the blocks are first copied to a host pool
//! and copied back on resumption.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::core::block::{compute_num_blocks, BlockId, BlockTable};
use crate::core::block_pool::BlockPool;
use crate::core::request::{Request, RequestId};
use crate::core::sequence::Sequence;
use crate::error::Result;

/// Victim order: lowest priority first, then most recently admitted.
pub fn victim_order(a: &Request, b: &Request) -> Ordering {
    a.priority()
        .cmp(&b.priority())
        .then_with(|| b.admitted_at().cmp(&a.admitted_at()))
}

/// First victim among `candidates`.
pub fn select_victim<'a>(candidates: impl IntoIterator<Item = &'a Request>) -> Option<RequestId> {
    candidates
        .into_iter()
        .min_by(|a, b| victim_order(a, b))
        .map(Request::request_id)
}

/// Release every device and host table of `req`.
pub(crate) fn release_all(
    pool: &mut BlockPool,
    mut host_pool: Option<&mut BlockPool>,
    req: &mut Request,
) -> Result<usize> {
    let mut freed = 0;
    for seq in req.seqs_mut() {
        freed += pool.release(seq.block_table_mut())?;
        if let Some(host) = host_pool.as_deref_mut() {
            host.release(seq.host_table_mut())?;
        }
    }
    Ok(freed)
}

/// Drop the victim's device blocks and forget what was computed.
pub(crate) fn preempt_recompute(pool: &mut BlockPool, req: &mut Request) -> Result<usize> {
    let mut freed = 0;
    for seq in req.live_seqs_mut() {
        freed += pool.release(seq.block_table_mut())?;
        seq.reset_computed();
    }
    Ok(freed)
}

/// Move the victim's device blocks to the host pool.
///
/// Blocks shared between the victim's samples stay shared on the host.
/// Returns `false`, changing nothing, if the host pool is short.
pub(crate) fn swap_out(
    pool: &mut BlockPool,
    host: &mut BlockPool,
    req: &mut Request,
    pairs: &mut Vec<(BlockId, BlockId)>,
) -> Result<bool> {
    let mut distinct = Vec::new();
    let mut seen = HashSet::new();
    for seq in req.live_seqs() {
        for &block_id in seq.block_table().get_physical_block_ids() {
            if seen.insert(block_id) {
                distinct.push(block_id);
            }
        }
    }
    if !host.can_allocate(distinct.len()) {
        return Ok(false);
    }

    let host_ids = host.allocate(distinct.len())?;
    let copies: Vec<(BlockId, BlockId)> = distinct.into_iter().zip(host_ids).collect();
    let mapping: HashMap<BlockId, BlockId> = copies.iter().copied().collect();
    pairs.extend(copies);

    // The allocation carries the first reference; later tables share.
    let mut placed = HashSet::new();
    for seq in req.live_seqs_mut() {
        let mut host_table = BlockTable::new(host.block_size());
        for &device_id in seq.block_table().get_physical_block_ids() {
            let Some(&host_id) = mapping.get(&device_id) else {
                continue;
            };
            if !placed.insert(host_id) {
                host.share(host_id)?;
            }
            host_table.append_block(host_id);
        }
        *seq.host_table_mut() = host_table;
        pool.release(seq.block_table_mut())?;
    }
    Ok(true)
}

/// Undo a swap-out whose copies to host were never made.
///
/// The host blocks hold nothing, so they are released and the request
/// falls back to recompute.
pub(crate) fn abandon_swap(host: &mut BlockPool, req: &mut Request) -> Result<usize> {
    let mut freed = 0;
    for seq in req.live_seqs_mut() {
        freed += host.release(seq.host_table_mut())?;
        seq.reset_computed();
    }
    req.requeue_for_recompute()?;
    Ok(freed)
}

/// Whether the next step writes into the sequence's current tail block.
fn writes_tail(seq: &Sequence, table: &BlockTable) -> bool {
    !table.is_empty() && seq.num_computed_tokens() < table.capacity()
}

/// Device blocks a swapped-out request needs to resume and take its next
/// step.
///
/// A shared tail that will be written is given one private device block
/// per writer, so resumed requests never need copy-on-write.
pub(crate) fn swap_in_need(host: &BlockPool, req: &Request) -> usize {
    let block_size = host.block_size();
    let mut shared = HashSet::new();
    let mut private = 0;
    let mut appends = 0;
    for seq in req.live_seqs() {
        let table = seq.host_table();
        let ids = table.get_physical_block_ids();
        let private_tail = writes_tail(seq, table)
            && table
                .last_block_id()
                .and_then(|last| host.ref_count(last))
                .is_some_and(|refs| refs > 1);
        for (idx, &host_id) in ids.iter().enumerate() {
            if private_tail && idx + 1 == ids.len() {
                private += 1;
            } else {
                shared.insert(host_id);
            }
        }
        appends += compute_num_blocks(seq.total_len(), block_size).saturating_sub(ids.len());
    }
    shared.len() + private + appends
}

/// Copy a swapped-out request back to device blocks.
///
/// The caller checks [`swap_in_need`] against the device pool first.
pub(crate) fn swap_in(
    pool: &mut BlockPool,
    host: &mut BlockPool,
    req: &mut Request,
    pairs: &mut Vec<(BlockId, BlockId)>,
) -> Result<()> {
    let mut shared: HashMap<BlockId, BlockId> = HashMap::new();
    for seq in req.live_seqs_mut() {
        let ids = seq.host_table().get_physical_block_ids().to_vec();
        let private_tail = writes_tail(seq, seq.host_table())
            && ids
                .last()
                .and_then(|&last| host.ref_count(last))
                .is_some_and(|refs| refs > 1);

        let mut table = BlockTable::new(pool.block_size());
        for (idx, &host_id) in ids.iter().enumerate() {
            let device_id = if private_tail && idx + 1 == ids.len() {
                let device_id = pool.allocate(1)?[0];
                pairs.push((host_id, device_id));
                device_id
            } else if let Some(&device_id) = shared.get(&host_id) {
                pool.share(device_id)?;
                device_id
            } else {
                let device_id = pool.allocate(1)?[0];
                shared.insert(host_id, device_id);
                pairs.push((host_id, device_id));
                device_id
            };
            table.append_block(device_id);
        }
        *seq.block_table_mut() = table;
    }

    // Host tables are released only once every device table is built, so
    // the sharing seen above is the sharing at swap-out.
    for seq in req.live_seqs_mut() {
        host.release(seq.host_table_mut())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::{GenerationRequest, RequestState};

    fn generating(id: RequestId, priority: i32, admitted: u64) -> Request {
        let mut req = Request::new(id, GenerationRequest::new(vec![1, 2, 3]).priority(priority), id, id, 4);
        req.transition(RequestState::Prefilling).unwrap();
        req.transition(RequestState::Generating).unwrap();
        req.set_admitted(admitted);
        req
    }

    #[test]
    fn test_victim_is_lowest_priority_then_latest_admitted() {
        let a = generating(1, 1, 0);
        let b = generating(2, 0, 1);
        let c = generating(3, 0, 2);

        assert_eq!(select_victim([&a, &b, &c]), Some(3));
        assert_eq!(select_victim([&a, &b]), Some(2));
        assert_eq!(select_victim([&a]), Some(1));
        assert_eq!(select_victim(std::iter::empty()), None);
    }

    #[test]
    fn test_recompute_frees_everything() {
        let mut pool = BlockPool::new(8, 4);
        let mut req = generating(1, 0, 0);
        *req.seqs_mut()[0].block_table_mut() = pool.allocate_table(2).unwrap();
        req.seqs_mut()[0].set_num_computed_tokens(3);

        assert_eq!(preempt_recompute(&mut pool, &mut req).unwrap(), 2);
        assert_eq!(pool.free_count(), 8);
        assert_eq!(req.seqs()[0].num_computed_tokens(), 0);
        assert!(req.seqs()[0].block_table().is_empty());
    }

    #[test]
    fn test_swap_round_trip_preserves_sharing() {
        let mut pool = BlockPool::new(8, 4);
        let mut host = BlockPool::new(8, 4);
        let mut req = generating(1, 0, 0);

        // Two samples sharing two full blocks, each with a private tail
        let shared = pool.allocate_table(2).unwrap();
        let sibling = req.seqs()[0].fork_history(9);
        req.seqs_mut().push(sibling);
        for seq in req.seqs_mut() {
            let mut table = pool.fork(&shared).unwrap();
            table.append_block(pool.allocate(1).unwrap()[0]);
            *seq.block_table_mut() = table;
        }
        let mut shared = shared;
        pool.release(&mut shared).unwrap();
        assert_eq!(pool.free_count(), 4);

        let mut out = Vec::new();
        assert!(swap_out(&mut pool, &mut host, &mut req, &mut out).unwrap());
        assert_eq!(out.len(), 4);
        assert_eq!(pool.free_count(), 8);
        assert_eq!(host.free_count(), 4);

        let mut back = Vec::new();
        assert_eq!(swap_in_need(&host, &req), 4);
        swap_in(&mut pool, &mut host, &mut req, &mut back).unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(host.free_count(), 8);
        let first = req.seqs()[0].block_table().get_physical_block_ids()[0];
        assert_eq!(pool.ref_count(first), Some(2));
    }

    #[test]
    fn test_swap_out_falls_back_when_host_is_short() {
        let mut pool = BlockPool::new(8, 4);
        let mut host = BlockPool::new(1, 4);
        let mut req = generating(1, 0, 0);
        *req.seqs_mut()[0].block_table_mut() = pool.allocate_table(2).unwrap();

        let mut out = Vec::new();
        assert!(!swap_out(&mut pool, &mut host, &mut req, &mut out).unwrap());
        assert!(out.is_empty());
        assert_eq!(pool.free_count(), 6);
    }
}
