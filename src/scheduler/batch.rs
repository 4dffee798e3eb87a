//! Continuous batching scheduler.
//!
//! The scheduler owns the block pool, the registry of requests and the
//! admission queue. Every step it grows the running requests, admits queued
//! ones while the budgets allow, and hands a [`BatchDescriptor`] to the
//! execution engine. The engine's answer is folded back in by
//! [`Scheduler::process_output`].
//!
//! ## Scheduling Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Scheduler Flow                               │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   add_request()                                   schedule()
//!        │                                              │
//!        ▼                                              ▼
//!   ┌─────────┐   admit (blocks allocated)       ┌─────────────┐
//!   │Admission│ ───────────────────────────────► │   Running   │ ──► Finished
//!   │  Queue  │                                  │    Set      │
//!   └─────────┘                                  └─────────────┘
//!        ▲          preempt (blocks released)           │
//!        └──────────────────────────────────────────────┘
//! ```
//!
//! Growth of running requests is resolved before admissions, so work in
//! progress wins memory over new arrivals.
//!
//! ## Example
//!
//! ```
//! use inflight_batcher::config::EngineConfig;
//! use inflight_batcher::core::request::GenerationRequest;
//! use inflight_batcher::scheduler::Scheduler;
//!
//! let mut scheduler = Scheduler::new(&EngineConfig::default()).unwrap();
//! scheduler.add_request(GenerationRequest::new(vec![1, 2, 3, 4])).unwrap();
//!
//! let batch = scheduler.schedule().unwrap();
//! assert_eq!(batch.num_sequences(), 1);
//! assert!(batch.entries[0].is_prefill);
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::preempt;
use super::queue::AdmissionQueue;
use crate::config::{EngineConfig, PreemptionMode};
use crate::core::block::{compute_num_blocks, hash_full_blocks, BlockId, BlockTable};
use crate::core::block_pool::BlockPool;
use crate::core::registry::Registry;
use crate::core::request::{
    GenerationParams, GenerationRequest, Request, RequestId, RequestOutput, RequestState, Resume,
};
use crate::core::sequence::{FinishReason, Sequence, SequenceId};
use crate::engine::executor::{BatchDescriptor, BatchEntry, SequenceOutput, StepOutput};
use crate::error::{EngineError, Error, Result};

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub num_waiting: usize,
    pub num_running: usize,
    pub num_free_blocks: usize,
    pub num_used_blocks: usize,
    pub num_host_free_blocks: usize,
    pub num_cached_prefixes: usize,
    /// Preemptions since the scheduler was created.
    pub num_preemptions: u64,
    pub num_steps: u64,
}

/// Check a submission against the engine limits.
///
/// # Errors
///
/// - [`Error::InvalidRequest`] for an empty prompt, `n == 0`, `n` above
///   `max_batch_size` or `max_new_tokens == 0`
/// - [`Error::ResourceExhausted`] if the prompt alone needs more blocks than
///   the pool holds
/// - [`Error::PromptTooLong`] if the prompt exceeds `max_aggregate_tokens`
pub fn validate_request(config: &EngineConfig, request: &GenerationRequest) -> Result<()> {
    let prompt_len = request.prompt_token_ids.len();
    if prompt_len == 0 {
        return Err(Error::InvalidRequest("prompt is empty".to_string()));
    }
    if request.params.n == 0 {
        return Err(Error::InvalidRequest("n must be at least 1".to_string()));
    }
    if request.params.n > config.scheduler.max_batch_size {
        return Err(Error::InvalidRequest(format!(
            "n ({}) exceeds max_batch_size ({})",
            request.params.n, config.scheduler.max_batch_size
        )));
    }
    if request.params.max_new_tokens == 0 {
        return Err(Error::InvalidRequest(
            "max_new_tokens must be at least 1".to_string(),
        ));
    }

    let required = compute_num_blocks(prompt_len, config.cache.block_size);
    if required > config.cache.num_blocks {
        return Err(Error::ResourceExhausted {
            required,
            capacity: config.cache.num_blocks,
        });
    }
    if prompt_len > config.scheduler.max_aggregate_tokens {
        return Err(Error::PromptTooLong {
            prompt_len,
            limit: config.scheduler.max_aggregate_tokens,
        });
    }
    Ok(())
}

/// Continuous batching scheduler.
///
/// Manages requests through their lifecycle:
/// - Queued: in the admission queue, holding no device blocks
/// - Prefilling / Generating: admitted, in the running set
/// - Finished / Cancelled / Errored / ResourceExhausted: blocks released,
///   result waiting in the registry until drained
///
/// [`schedule`](Self::schedule) and [`process_output`](Self::process_output)
/// must alternate: the memory state of an outstanding batch is never
/// touched.
pub struct Scheduler {
    config: EngineConfig,
    /// Device blocks.
    pool: BlockPool,
    /// Host blocks for swap preemption.
    host_pool: Option<BlockPool>,
    registry: Registry,
    queue: AdmissionQueue,
    /// Admitted requests in admission order.
    running: Vec<RequestId>,
    /// Requests admitted by the current `schedule` call.
    admitted_this_step: Vec<RequestId>,
    /// Monotonic admission stamp.
    admission_counter: u64,
    num_steps: u64,
    num_preemptions: u64,
}

impl Scheduler {
    /// Create a scheduler with empty pools.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration does not validate.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let cache = &config.cache;
        Ok(Self {
            config: config.clone(),
            pool: BlockPool::new(cache.num_blocks, cache.block_size),
            host_pool: (cache.num_host_blocks > 0)
                .then(|| BlockPool::new(cache.num_host_blocks, cache.block_size)),
            registry: Registry::new(),
            queue: AdmissionQueue::new(),
            running: Vec::new(),
            admitted_this_step: Vec::new(),
            admission_counter: 0,
            num_steps: 0,
            num_preemptions: 0,
        })
    }

    // ========== Submission & cancellation ==========

    /// Validate and enqueue a request under a scheduler-assigned id.
    pub fn add_request(&mut self, request: GenerationRequest) -> Result<RequestId> {
        validate_request(&self.config, &request)?;
        let request_id = self.registry.next_request_id();
        self.insert_request(request_id, request)?;
        Ok(request_id)
    }

    /// Enqueue an already validated request under an id chosen by the
    /// caller.
    pub(crate) fn insert_request(
        &mut self,
        request_id: RequestId,
        request: GenerationRequest,
    ) -> Result<()> {
        let priority = request.priority;
        let prompt_len = request.prompt_token_ids.len();
        let arrival_order = self
            .registry
            .insert(request_id, request, self.block_size())?;
        self.queue.push(request_id, priority, arrival_order);
        debug!(request_id, priority, prompt_len, "request queued");
        Ok(())
    }

    /// Cancel a request, releasing its blocks.
    ///
    /// # Returns
    ///
    /// `true` if the request existed and was not already terminal.
    pub fn cancel(&mut self, request_id: RequestId) -> Result<bool> {
        match self.registry.get(request_id) {
            Some(req) if !req.is_terminal() => {}
            _ => return Ok(false),
        }
        self.terminate(request_id, RequestState::Cancelled)?;
        info!(request_id, "request cancelled");
        Ok(true)
    }

    // ========== Scheduling ==========

    /// Select the next batch.
    ///
    /// Never fails for lack of memory: requests that do not fit stay queued
    /// or are preempted. Errors signal broken block accounting.
    #[instrument(skip_all, fields(step = self.num_steps))]
    pub fn schedule(&mut self) -> Result<BatchDescriptor> {
        let mut batch = BatchDescriptor {
            step: self.num_steps,
            ..BatchDescriptor::default()
        };
        self.admitted_this_step.clear();

        self.grow_running(&mut batch)?;
        self.admit_queued(&mut batch)?;
        self.build_entries(&mut batch);
        self.num_steps += 1;

        if !batch.is_empty() {
            debug!(
                num_seqs = batch.num_sequences(),
                num_tokens = batch.num_tokens(),
                num_prefills = batch.num_prefills(),
                free_blocks = self.pool.free_count(),
                "batch scheduled"
            );
        }
        Ok(batch)
    }

    /// Give every running sequence room for the tokens it writes next step.
    fn grow_running(&mut self, batch: &mut BatchDescriptor) -> Result<()> {
        // Highest priority and earliest admitted first: any victim chosen
        // while growing one request has not been grown yet.
        let mut order: Vec<&Request> = self.running_requests().collect();
        order.sort_by(|a, b| preempt::victim_order(b, a));
        let order: Vec<RequestId> = order.into_iter().map(Request::request_id).collect();

        for request_id in order {
            if self.running.contains(&request_id) {
                self.grow_request(request_id, batch)?;
            }
        }
        Ok(())
    }

    fn grow_request(&mut self, request_id: RequestId, batch: &mut BatchDescriptor) -> Result<()> {
        loop {
            let req = self.registry.require_mut(request_id)?;
            let need = growth_need(&self.pool, req);
            if self.pool.can_allocate(need) {
                return apply_growth(&mut self.pool, req, &mut batch.blocks_to_copy);
            }

            match preempt::select_victim(self.running_requests()) {
                Some(victim) if victim != request_id => self.preempt(victim, batch)?,
                _ if self.running.len() > 1 => return self.preempt(request_id, batch),
                _ => {
                    warn!(
                        request_id,
                        need,
                        capacity = self.pool.capacity(),
                        "request cannot grow even as sole holder"
                    );
                    return self.terminate(request_id, RequestState::ResourceExhausted);
                }
            }
        }
    }

    /// Admit queued requests in queue order until one does not fit.
    fn admit_queued(&mut self, batch: &mut BatchDescriptor) -> Result<()> {
        let max_seqs = self.config.scheduler.max_batch_size;
        let max_tokens = self.config.scheduler.max_aggregate_tokens;

        while let Some(request_id) = self.queue.peek() {
            let Some(req) = self.registry.get(request_id) else {
                self.queue.pop();
                continue;
            };
            let (num_seqs, num_tokens) = self.running_load();
            let (mut blocks, tokens) = self.admission_cost(req);

            if num_seqs + req.max_running_seqs() > max_seqs {
                break;
            }
            // An oversized prefill only runs in an otherwise empty batch.
            if num_seqs > 0 && num_tokens + tokens > max_tokens {
                break;
            }

            if !self.pool.can_allocate(blocks) {
                if self.preempt_for_admission(request_id, blocks, batch)? {
                    let req = self
                        .registry
                        .get(request_id)
                        .ok_or(Error::RequestNotFound(request_id))?;
                    blocks = self.admission_cost(req).0;
                }
                if !self.pool.can_allocate(blocks) {
                    let deferred = self.registry.require_mut(request_id)?.record_deferral();
                    if deferred > self.config.scheduler.max_deferred_steps {
                        warn!(request_id, deferred, blocks, "request deferred too long");
                        self.terminate(request_id, RequestState::ResourceExhausted)?;
                        continue;
                    }
                    debug!(
                        request_id,
                        blocks,
                        free = self.pool.free_count(),
                        "admission deferred"
                    );
                    break;
                }
            }

            self.queue.pop();
            self.admit(request_id, batch)?;
        }
        Ok(())
    }

    /// Preempt lower-priority requests if that frees enough blocks.
    ///
    /// Nothing is preempted unless the plan covers `needed`.
    fn preempt_for_admission(
        &mut self,
        candidate: RequestId,
        needed: usize,
        batch: &mut BatchDescriptor,
    ) -> Result<bool> {
        let priority = self
            .registry
            .get(candidate)
            .map(Request::priority)
            .ok_or(Error::RequestNotFound(candidate))?;

        let mut victims: Vec<&Request> = self
            .running_requests()
            .filter(|r| {
                r.state() == RequestState::Generating
                    && r.priority() < priority
                    && !self.admitted_this_step.contains(&r.request_id())
            })
            .collect();
        victims.sort_by(|a, b| preempt::victim_order(a, b));

        let free = self.pool.free_count();
        let mut chosen = Vec::new();
        let mut tables: Vec<&BlockTable> = Vec::new();
        let mut enough = false;
        for victim in victims {
            chosen.push(victim.request_id());
            tables.extend(victim.live_seqs().map(Sequence::block_table));
            if free + self.pool.reclaimable(tables.iter().copied()) >= needed {
                enough = true;
                break;
            }
        }
        if !enough {
            return Ok(false);
        }

        for victim in chosen {
            self.preempt(victim, batch)?;
        }
        Ok(true)
    }

    /// Take every device block from a generating request and requeue it.
    fn preempt(&mut self, request_id: RequestId, batch: &mut BatchDescriptor) -> Result<()> {
        self.running.retain(|&id| id != request_id);
        let swap = self.config.scheduler.preemption_mode == PreemptionMode::Swap;
        let req = self.registry.require_mut(request_id)?;

        // Copies into the victim's blocks are moot once it lets go.
        let owned: Vec<BlockId> = req
            .live_seqs()
            .flat_map(|s| s.block_table().get_physical_block_ids().iter().copied())
            .collect();
        let pending = batch.blocks_to_copy.len();
        batch.blocks_to_copy.retain(|(_, dst)| !owned.contains(dst));
        let had_pending_copy = batch.blocks_to_copy.len() != pending;

        let swapped = match self.host_pool.as_mut() {
            Some(host) if swap && !had_pending_copy => {
                preempt::swap_out(&mut self.pool, host, req, &mut batch.blocks_to_swap_out)?
            }
            _ => false,
        };
        let freed = if swapped {
            0
        } else {
            preempt::preempt_recompute(&mut self.pool, req)?
        };

        let resume = if swapped {
            Resume::Swapped
        } else {
            Resume::Recompute
        };
        req.transition(RequestState::Preempted)?;
        req.transition(RequestState::Queued(resume))?;
        self.queue
            .push(request_id, req.priority(), req.arrival_order());
        self.num_preemptions += 1;

        info!(
            request_id,
            ?resume,
            freed,
            priority = req.priority(),
            "request preempted"
        );
        Ok(())
    }

    fn admit(&mut self, request_id: RequestId, batch: &mut BatchDescriptor) -> Result<()> {
        let block_size = self.block_size();
        let prefix_caching = self.config.cache.enable_prefix_caching;
        let stamp = self.admission_counter;
        self.admission_counter += 1;

        let req = self.registry.require_mut(request_id)?;
        let resume = match req.state() {
            RequestState::Queued(resume) => resume,
            other => {
                return Err(Error::InvalidStateTransition {
                    from: other.as_str(),
                    to: "Prefilling",
                })
            }
        };

        match resume {
            Resume::Fresh => {
                let Some(seq) = req.seqs_mut().first_mut() else {
                    return Err(Error::InvariantViolation(format!(
                        "request {request_id} has no sequence"
                    )));
                };
                let hashes =
                    reusable_prefix_hashes(prefix_caching, seq.prompt_token_ids(), block_size);
                let hits = self.pool.match_prefix(&hashes);
                let missing =
                    compute_num_blocks(seq.prompt_len(), block_size).saturating_sub(hits.len());
                let fresh = match self.pool.allocate(missing) {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        for &block_id in &hits {
                            self.pool.free(block_id)?;
                        }
                        return Err(e);
                    }
                };

                let num_hits = hits.len();
                let mut block_ids = hits;
                block_ids.extend(fresh);
                *seq.block_table_mut() = BlockTable::from_blocks(block_size, block_ids);
                seq.set_num_computed_tokens(num_hits * block_size);
                if num_hits > 0 {
                    debug!(request_id, num_hits, "prefix cache hit");
                }
                req.transition(RequestState::Prefilling)?;
            }
            Resume::Recompute => {
                for seq in req.live_seqs_mut() {
                    let num_blocks = compute_num_blocks(seq.total_len(), block_size);
                    *seq.block_table_mut() = self.pool.allocate_table(num_blocks)?;
                    seq.reset_computed();
                }
                req.transition(RequestState::Prefilling)?;
            }
            Resume::Swapped => {
                let host = self.host_pool.as_mut().ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "request {request_id} swapped out without a host pool"
                    ))
                })?;
                preempt::swap_in(&mut self.pool, host, req, &mut batch.blocks_to_swap_in)?;
                apply_growth(&mut self.pool, req, &mut batch.blocks_to_copy)?;
                req.transition(RequestState::Generating)?;
            }
        }

        req.set_admitted(stamp);
        debug!(request_id, ?resume, "request admitted");
        self.running.push(request_id);
        self.admitted_this_step.push(request_id);
        Ok(())
    }

    fn build_entries(&self, batch: &mut BatchDescriptor) {
        for req in self.running_requests() {
            let is_prefill = req.state() == RequestState::Prefilling;
            let fan_out = if is_prefill && req.seqs().len() < req.params().n {
                req.params().n
            } else {
                1
            };
            for seq in req.live_seqs() {
                batch.entries.push(BatchEntry {
                    request_id: req.request_id(),
                    seq_id: seq.seq_id(),
                    block_ids: seq.block_table().get_physical_block_ids().to_vec(),
                    input_tokens: seq.uncomputed_token_ids(),
                    num_computed_tokens: seq.num_computed_tokens(),
                    num_new_tokens: fan_out,
                    is_prefill,
                });
            }
        }
    }

    // ========== Step results ==========

    /// Fold the engine's answer for `batch` back into request state.
    ///
    /// An engine error, or an output that does not match the batch, errors
    /// every request of the batch.
    #[instrument(skip_all, fields(step = batch.step))]
    pub fn process_output(
        &mut self,
        batch: &BatchDescriptor,
        result: std::result::Result<StepOutput, EngineError>,
    ) -> Result<()> {
        let output = match result.and_then(|output| check_output(batch, output)) {
            Ok(output) => output,
            Err(err) => return self.fail_batch(batch, &err),
        };

        let mut touched: Vec<RequestId> = Vec::new();
        for entry in &batch.entries {
            // Cancelled while the step ran: the result is dropped.
            if !self.is_live(entry.request_id) {
                continue;
            }
            if let Some(out) = output.get(entry.seq_id) {
                self.apply_entry(entry, out)?;
            }
            if touched.last() != Some(&entry.request_id) {
                touched.push(entry.request_id);
            }
        }
        for request_id in touched {
            self.settle(request_id)?;
        }
        Ok(())
    }

    fn apply_entry(&mut self, entry: &BatchEntry, out: &SequenceOutput) -> Result<()> {
        let eos_token_id = self.config.eos_token_id;
        let register_prefix = entry.is_prefill && self.config.cache.enable_prefix_caching;

        let fan_out = {
            let req = self.registry.require_mut(entry.request_id)?;
            if entry.is_prefill && req.seqs().len() < req.params().n {
                req.params().n
            } else {
                1
            }
        };
        let sibling_ids: Vec<SequenceId> =
            (1..fan_out).map(|_| self.registry.next_seq_id()).collect();

        let req = self.registry.require_mut(entry.request_id)?;
        let params = req.params().clone();
        let seq = req.get_seq_mut(entry.seq_id).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "sequence {} not in request {}",
                entry.seq_id, entry.request_id
            ))
        })?;
        seq.set_num_computed_tokens(entry.num_computed_tokens + entry.input_tokens.len());

        if register_prefix {
            register_prompt_blocks(&mut self.pool, seq)?;
        }

        // Parallel samples share the prompt blocks until they write.
        let mut siblings = Vec::with_capacity(sibling_ids.len());
        for (seq_id, &token) in sibling_ids.into_iter().zip(out.new_tokens.iter().skip(1)) {
            let mut sibling = seq.fork_history(seq_id);
            *sibling.block_table_mut() = self.pool.fork(seq.block_table())?;
            append_tokens(&mut sibling, &[token], out.done, &params, eos_token_id);
            siblings.push(sibling);
        }

        let own_tokens: &[u32] = if fan_out > 1 {
            out.new_tokens.get(..1).unwrap_or_default()
        } else {
            &out.new_tokens
        };
        append_tokens(seq, own_tokens, out.done, &params, eos_token_id);

        for s in std::iter::once(seq).chain(siblings.iter_mut()) {
            if s.is_finished() {
                self.pool.release(s.block_table_mut())?;
            }
        }
        req.seqs_mut().extend(siblings);
        Ok(())
    }

    fn settle(&mut self, request_id: RequestId) -> Result<()> {
        let req = self.registry.require_mut(request_id)?;
        if req.is_terminal() {
            return Ok(());
        }
        if req.all_seqs_finished() {
            debug!(
                request_id,
                num_preemptions = req.num_preemptions(),
                "request finished"
            );
            return self.terminate(request_id, RequestState::Finished);
        }
        if req.state() == RequestState::Prefilling {
            req.transition(RequestState::Generating)?;
        }
        Ok(())
    }

    fn is_live(&self, request_id: RequestId) -> bool {
        self.registry
            .get(request_id)
            .is_some_and(|req| !req.is_terminal())
    }

    fn fail_batch(&mut self, batch: &BatchDescriptor, err: &EngineError) -> Result<()> {
        error!(step = batch.step, %err, "execution engine failed, erroring batch");
        self.abandon_failed_swaps(batch)?;

        let mut failed: Vec<RequestId> = Vec::new();
        for entry in &batch.entries {
            if failed.last() != Some(&entry.request_id) {
                failed.push(entry.request_id);
            }
        }
        for request_id in failed {
            let Some(req) = self.registry.get_mut(request_id) else {
                continue;
            };
            if req.is_terminal() {
                continue;
            }
            req.set_error(err.to_string());
            self.terminate(request_id, RequestState::Errored)?;
        }
        Ok(())
    }

    /// Requests swapped out by a failed step point at host blocks the
    /// engine never filled. They resume by recompute instead.
    fn abandon_failed_swaps(&mut self, batch: &BatchDescriptor) -> Result<()> {
        let Some(host) = self.host_pool.as_mut() else {
            return Ok(());
        };
        let targets: HashSet<BlockId> = batch
            .blocks_to_swap_out
            .iter()
            .map(|&(_, host_id)| host_id)
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let stale: Vec<RequestId> = self
            .registry
            .iter()
            .filter(|req| req.state() == RequestState::Queued(Resume::Swapped))
            .filter(|req| {
                req.live_seqs().any(|seq| {
                    seq.host_table()
                        .get_physical_block_ids()
                        .iter()
                        .any(|id| targets.contains(id))
                })
            })
            .map(Request::request_id)
            .collect();
        for request_id in stale {
            let req = self.registry.require_mut(request_id)?;
            let freed = preempt::abandon_swap(host, req)?;
            warn!(request_id, freed, "swap-out lost with failed step, resuming by recompute");
        }
        Ok(())
    }

    /// Release everything a request holds and move it to `state`.
    fn terminate(&mut self, request_id: RequestId, state: RequestState) -> Result<()> {
        self.running.retain(|&id| id != request_id);
        self.queue.remove(request_id);
        let req = self.registry.require_mut(request_id)?;
        preempt::release_all(&mut self.pool, self.host_pool.as_mut(), req)?;
        self.registry.finish(request_id, state)
    }

    /// Take the results of every request that reached a terminal state.
    pub fn drain_finished(&mut self) -> Vec<RequestOutput> {
        self.registry.drain_finished()
    }

    // ========== Accounting ==========

    fn running_requests(&self) -> impl Iterator<Item = &Request> + '_ {
        self.running.iter().filter_map(|id| self.registry.get(*id))
    }

    /// Sequences and tokens of the running set for the next step.
    fn running_load(&self) -> (usize, usize) {
        self.running_requests().fold((0, 0), |(seqs, tokens), req| {
            (
                seqs + req.max_running_seqs(),
                tokens
                    + req
                        .live_seqs()
                        .map(Sequence::num_uncomputed_tokens)
                        .sum::<usize>(),
            )
        })
    }

    /// Device blocks and step tokens needed to admit a queued request.
    fn admission_cost(&self, req: &Request) -> (usize, usize) {
        let block_size = self.block_size();
        match req.state() {
            RequestState::Queued(Resume::Swapped) => {
                let blocks = self
                    .host_pool
                    .as_ref()
                    .map_or(0, |host| preempt::swap_in_need(host, req));
                let tokens = req.live_seqs().map(Sequence::num_uncomputed_tokens).sum();
                (blocks, tokens)
            }
            RequestState::Queued(Resume::Recompute) => {
                req.live_seqs().fold((0, 0), |(blocks, tokens), seq| {
                    (
                        blocks + compute_num_blocks(seq.total_len(), block_size),
                        tokens + seq.total_len(),
                    )
                })
            }
            _ => {
                let prompt = req
                    .seqs()
                    .first()
                    .map(Sequence::prompt_token_ids)
                    .unwrap_or_default();
                let hashes = reusable_prefix_hashes(
                    self.config.cache.enable_prefix_caching,
                    prompt,
                    block_size,
                );
                let hits = self.pool.count_prefix_hits(&hashes);
                (
                    compute_num_blocks(prompt.len(), block_size).saturating_sub(hits),
                    prompt.len() - hits * block_size,
                )
            }
        }
    }

    /// Check block conservation in both pools.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if free and used blocks do not
    /// add up to the capacity, or if the references held by block tables do
    /// not match the reference counts.
    pub fn check_invariants(&self) -> Result<()> {
        check_pool(
            "device",
            &self.pool,
            self.registry
                .iter()
                .flat_map(Request::seqs)
                .map(Sequence::block_table),
        )?;
        if let Some(host) = &self.host_pool {
            check_pool(
                "host",
                host,
                self.registry
                    .iter()
                    .flat_map(Request::seqs)
                    .map(Sequence::host_table),
            )?;
        }
        Ok(())
    }

    // ========== Getters ==========

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.cache.block_size
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn host_pool(&self) -> Option<&BlockPool> {
        self.host_pool.as_ref()
    }

    pub fn get_request(&self, request_id: RequestId) -> Option<&Request> {
        self.registry.get(request_id)
    }

    /// Number of queued requests.
    pub fn num_waiting(&self) -> usize {
        self.queue.len()
    }

    /// Number of admitted requests.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Admitted request ids in admission order.
    pub fn running_request_ids(&self) -> &[RequestId] {
        &self.running
    }

    /// Whether any request is queued or running.
    pub fn has_pending_requests(&self) -> bool {
        !self.queue.is_empty() || !self.running.is_empty()
    }

    /// Whether any result has not been drained yet.
    pub fn has_unfinished_requests(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            num_waiting: self.queue.len(),
            num_running: self.running.len(),
            num_free_blocks: self.pool.free_count(),
            num_used_blocks: self.pool.num_used_blocks(),
            num_host_free_blocks: self.host_pool.as_ref().map_or(0, BlockPool::free_count),
            num_cached_prefixes: self.pool.num_cached_prefixes(),
            num_preemptions: self.num_preemptions,
            num_steps: self.num_steps,
        }
    }
}

/// Hashes of the prompt blocks that may be taken from the prefix cache.
///
/// At least one prompt token is always left to compute.
fn reusable_prefix_hashes(enabled: bool, prompt: &[u32], block_size: usize) -> Vec<u64> {
    if !enabled || prompt.is_empty() {
        return Vec::new();
    }
    let mut hashes = hash_full_blocks(prompt, block_size);
    hashes.truncate((prompt.len() - 1) / block_size);
    hashes
}

fn register_prompt_blocks(pool: &mut BlockPool, seq: &Sequence) -> Result<()> {
    let hashes = hash_full_blocks(seq.prompt_token_ids(), pool.block_size());
    for (idx, hash) in hashes.into_iter().enumerate() {
        if !pool.is_prefix_cached(hash) {
            pool.cache_block(seq.block_table().get_block_id(idx)?, hash);
        }
    }
    Ok(())
}

/// New blocks a request needs before its next step: appends for tokens
/// beyond capacity plus copy-on-write for shared tails that get written.
fn growth_need(pool: &BlockPool, req: &Request) -> usize {
    let block_size = pool.block_size();
    let mut appends = 0;
    let mut tail_writers: HashMap<BlockId, usize> = HashMap::new();
    for seq in req.live_seqs() {
        let table = seq.block_table();
        appends += compute_num_blocks(seq.total_len(), block_size).saturating_sub(table.num_blocks());
        if seq.num_computed_tokens() < table.capacity() {
            if let Some(tail) = table.last_block_id() {
                *tail_writers.entry(tail).or_default() += 1;
            }
        }
    }
    // The last holder of a shared tail writes in place.
    let copies: usize = tail_writers
        .iter()
        .map(|(&tail, &writers)| {
            let refs = pool.ref_count(tail).unwrap_or(1);
            writers.min(refs.saturating_sub(1))
        })
        .sum();
    appends + copies
}

fn apply_growth(
    pool: &mut BlockPool,
    req: &mut Request,
    copies: &mut Vec<(BlockId, BlockId)>,
) -> Result<()> {
    let block_size = pool.block_size();
    for seq in req.live_seqs_mut() {
        let computed = seq.num_computed_tokens();
        let target = compute_num_blocks(seq.total_len(), block_size);
        let table = seq.block_table_mut();
        if computed < table.capacity() {
            if let Some(copy) = pool.copy_on_write(table)? {
                copies.push(copy);
            }
        }
        for block_id in pool.allocate(target.saturating_sub(table.num_blocks()))? {
            table.append_block(block_id);
        }
    }
    Ok(())
}

fn check_output(
    batch: &BatchDescriptor,
    output: StepOutput,
) -> std::result::Result<StepOutput, EngineError> {
    for entry in &batch.entries {
        let out = output
            .get(entry.seq_id)
            .ok_or(EngineError::MissingOutput(entry.seq_id))?;
        if out.new_tokens.len() != entry.num_new_tokens {
            return Err(EngineError::UnexpectedTokenCount {
                seq_id: entry.seq_id,
                expected: entry.num_new_tokens,
                got: out.new_tokens.len(),
            });
        }
    }
    if let Some(unknown) = output.seq_ids().find(|id| batch.get(*id).is_none()) {
        return Err(EngineError::UnknownSequence(unknown));
    }
    Ok(output)
}

/// Append sampled tokens, stopping at the first that ends the sample.
fn append_tokens(
    seq: &mut Sequence,
    tokens: &[u32],
    done: bool,
    params: &GenerationParams,
    eos_token_id: Option<u32>,
) {
    for (idx, &token) in tokens.iter().enumerate() {
        seq.append_token(token);
        let reason = if done && idx + 1 == tokens.len() {
            Some(FinishReason::EndOfSequence)
        } else {
            stop_reason(seq, token, params, eos_token_id)
        };
        if let Some(reason) = reason {
            seq.set_finished(reason);
            return;
        }
    }
}

fn stop_reason(
    seq: &Sequence,
    token: u32,
    params: &GenerationParams,
    eos_token_id: Option<u32>,
) -> Option<FinishReason> {
    if !params.ignore_eos && eos_token_id == Some(token) {
        return Some(FinishReason::EndOfSequence);
    }
    if params.stop_token_ids.contains(&token) {
        return Some(FinishReason::StopToken);
    }
    if params
        .stop_sequences
        .iter()
        .any(|stop| seq.output_ends_with(stop))
    {
        return Some(FinishReason::StopSequence);
    }
    if seq.output_len() >= params.max_new_tokens {
        return Some(FinishReason::MaxTokens);
    }
    None
}

fn check_pool<'a>(
    name: &str,
    pool: &BlockPool,
    tables: impl Iterator<Item = &'a BlockTable>,
) -> Result<()> {
    let free = pool.free_count();
    let used = pool.num_used_blocks();
    if free + used != pool.capacity() {
        return Err(Error::InvariantViolation(format!(
            "{name} pool: {free} free + {used} used != {} blocks",
            pool.capacity()
        )));
    }
    let held: usize = tables.map(BlockTable::num_blocks).sum();
    let counted = pool.total_ref_count();
    if held != counted {
        return Err(Error::InvariantViolation(format!(
            "{name} pool: tables hold {held} references, counts sum to {counted}"
        )));
    }
    Ok(())
}
