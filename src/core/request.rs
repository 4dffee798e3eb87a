//! Requests and their lifecycle state machine.
//!
//! ```text
//!              admit                step done
//!   Queued ─────────────► Prefilling ─────────► Generating ──► Finished
//!     ▲  │ swap-in                                 │  │  │
//!     │  └─────────────────────────────────────────┘  │  └───► Cancelled / Errored
//!     │                 preempt                       │
//!     └───────────────── Preempted ◄──────────────────┘
//! ```
//!
//! Terminal states: `Finished`, `Cancelled`, `Errored`, `ResourceExhausted`.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::sequence::{FinishReason, Sequence, SequenceId};
use crate::error::{Error, Result};

/// Unique identifier for a request.
pub type RequestId = u64;

/// Priority level for scheduling. Higher values are more urgent.
pub type Priority = i32;

/// Default priority for new requests.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Per-request generation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Maximum tokens to generate per sample.
    pub max_new_tokens: usize,
    /// Token ids that end a sample.
    pub stop_token_ids: Vec<u32>,
    /// Token sequences that end a sample when the output ends with them.
    pub stop_sequences: Vec<Vec<u32>>,
    /// Keep generating past the model's EOS token.
    pub ignore_eos: bool,
    /// Number of parallel samples drawn from the prompt.
    pub n: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            stop_token_ids: Vec::new(),
            stop_sequences: Vec::new(),
            ignore_eos: false,
            n: 1,
        }
    }
}

/// A generation request as submitted by a caller.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Tokenized prompt.
    pub prompt_token_ids: Vec<u32>,
    /// Generation parameters.
    pub params: GenerationParams,
    /// Priority (higher = more important).
    pub priority: Priority,
}

impl GenerationRequest {
    /// Create a new generation request with default settings.
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            params: GenerationParams::default(),
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Set the maximum tokens to generate.
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.params.max_new_tokens = max_new_tokens;
        self
    }

    /// Add a stop token id.
    pub fn stop_token(mut self, token_id: u32) -> Self {
        self.params.stop_token_ids.push(token_id);
        self
    }

    /// Add a stop token sequence.
    pub fn stop_sequence(mut self, tokens: Vec<u32>) -> Self {
        self.params.stop_sequences.push(tokens);
        self
    }

    /// Ignore the model's EOS token.
    pub fn ignore_eos(mut self, ignore: bool) -> Self {
        self.params.ignore_eos = ignore;
        self
    }

    /// Set the number of parallel samples.
    pub fn num_samples(mut self, n: usize) -> Self {
        self.params.n = n;
        self
    }

    /// Set request priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// How a queued request gets its cache when admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Never ran: prefill the prompt.
    Fresh,
    /// Preempted by recompute: prefill the whole history.
    Recompute,
    /// Preempted by swap: copy the host blocks back.
    Swapped,
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued(Resume),
    Prefilling,
    Generating,
    Preempted,
    Finished,
    Cancelled,
    Errored,
    ResourceExhausted,
}

impl RequestState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Cancelled | Self::Errored | Self::ResourceExhausted
        )
    }

    /// Get the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued(_) => "Queued",
            Self::Prefilling => "Prefilling",
            Self::Generating => "Generating",
            Self::Preempted => "Preempted",
            Self::Finished => "Finished",
            Self::Cancelled => "Cancelled",
            Self::Errored => "Errored",
            Self::ResourceExhausted => "ResourceExhausted",
        }
    }

    /// Whether `self -> to` is an edge of the lifecycle.
    pub fn can_transition_to(&self, to: RequestState) -> bool {
        use RequestState::*;
        match (*self, to) {
            (Queued(Resume::Swapped), Generating) => true,
            (Queued(Resume::Fresh | Resume::Recompute), Prefilling) => true,
            (Queued(_), Cancelled | ResourceExhausted) => true,
            (Prefilling, Generating | Finished | Cancelled | Errored) => true,
            (Generating, Preempted | Finished | Cancelled | Errored | ResourceExhausted) => true,
            (Preempted, Queued(Resume::Recompute | Resume::Swapped)) => true,
            (
                Queued(_) | Prefilling | Generating | Preempted | Finished | Cancelled | Errored
                | ResourceExhausted,
                _,
            ) => false,
        }
    }
}

/// Terminal status delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum RequestStatus {
    Finished,
    Cancelled,
    Errored(String),
    ResourceExhausted,
}

/// Output of one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOutput {
    /// Sample index within the request.
    pub index: usize,
    /// Generated token IDs.
    pub token_ids: Vec<u32>,
    /// Reason for finishing, if the sample finished normally.
    pub finish_reason: Option<FinishReason>,
}

/// Terminal result of a request, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutput {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub prompt_len: usize,
    pub outputs: Vec<CompletionOutput>,
    /// Times the request lost its cache to preemption.
    pub num_preemptions: usize,
}

/// A request owned by the registry.
#[derive(Debug, Clone)]
pub struct Request {
    request_id: RequestId,
    params: GenerationParams,
    priority: Priority,
    arrival_time: Instant,
    /// Monotonic submission order, FIFO tie-break.
    arrival_order: u64,
    /// Monotonic admission stamp of the latest admission.
    admitted_at: Option<u64>,
    state: RequestState,
    seqs: Vec<Sequence>,
    /// Steps this request was refused blocks since its last admission.
    deferred_steps: usize,
    num_preemptions: usize,
    error: Option<String>,
}

impl Request {
    /// Create a queued request with a single sequence.
    ///
    /// Further samples (`params.n > 1`) are forked from it after prefill.
    pub fn new(
        request_id: RequestId,
        request: GenerationRequest,
        arrival_order: u64,
        seq_id: SequenceId,
        block_size: usize,
    ) -> Self {
        Self {
            request_id,
            priority: request.priority,
            arrival_time: Instant::now(),
            arrival_order,
            admitted_at: None,
            state: RequestState::Queued(Resume::Fresh),
            seqs: vec![Sequence::new(seq_id, request.prompt_token_ids, block_size)],
            params: request.params,
            deferred_steps: 0,
            num_preemptions: 0,
            error: None,
        }
    }

    // ========== Getters ==========

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn arrival_order(&self) -> u64 {
        self.arrival_order
    }

    pub fn admitted_at(&self) -> Option<u64> {
        self.admitted_at
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn deferred_steps(&self) -> usize {
        self.deferred_steps
    }

    pub fn num_preemptions(&self) -> usize {
        self.num_preemptions
    }

    pub fn prompt_len(&self) -> usize {
        self.seqs.first().map_or(0, Sequence::prompt_len)
    }

    /// Sequences in sample order.
    pub fn seqs(&self) -> &[Sequence] {
        &self.seqs
    }

    pub(crate) fn seqs_mut(&mut self) -> &mut Vec<Sequence> {
        &mut self.seqs
    }

    pub fn get_seq(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.seqs.iter().find(|s| s.seq_id() == seq_id)
    }

    pub(crate) fn get_seq_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.seqs.iter_mut().find(|s| s.seq_id() == seq_id)
    }

    /// Sequences still generating.
    pub fn live_seqs(&self) -> impl Iterator<Item = &Sequence> {
        self.seqs.iter().filter(|s| !s.is_finished())
    }

    pub(crate) fn live_seqs_mut(&mut self) -> impl Iterator<Item = &mut Sequence> {
        self.seqs.iter_mut().filter(|s| !s.is_finished())
    }

    pub fn num_live_seqs(&self) -> usize {
        self.live_seqs().count()
    }

    /// Sequences this request will occupy in a batch once running.
    ///
    /// Before its first step a request counts all samples it will fork
    /// into.
    pub fn max_running_seqs(&self) -> usize {
        if self.seqs.len() < self.params.n {
            self.params.n
        } else {
            self.num_live_seqs()
        }
    }

    /// Whether every sample has finished.
    pub fn all_seqs_finished(&self) -> bool {
        self.seqs.iter().all(Sequence::is_finished)
    }

    // ========== State transitions ==========

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if `to` is not reachable
    /// from the current state.
    pub fn transition(&mut self, to: RequestState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        if to == RequestState::Preempted {
            self.num_preemptions += 1;
        }
        self.state = to;
        Ok(())
    }

    pub(crate) fn set_admitted(&mut self, stamp: u64) {
        self.admitted_at = Some(stamp);
        self.deferred_steps = 0;
    }

    /// Turn a swapped-out request into one that resumes by recompute.
    ///
    /// Used when the copies to host never happened.
    pub(crate) fn requeue_for_recompute(&mut self) -> Result<()> {
        let to = RequestState::Queued(Resume::Recompute);
        if self.state != RequestState::Queued(Resume::Swapped) {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        self.state = to;
        Ok(())
    }

    pub(crate) fn record_deferral(&mut self) -> usize {
        self.deferred_steps += 1;
        self.deferred_steps
    }

    pub(crate) fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// Build the caller-visible result. Only meaningful once terminal.
    pub fn to_output(&self) -> RequestOutput {
        let status = match self.state {
            RequestState::Cancelled => RequestStatus::Cancelled,
            RequestState::Errored => {
                RequestStatus::Errored(self.error.clone().unwrap_or_default())
            }
            RequestState::ResourceExhausted => RequestStatus::ResourceExhausted,
            _ => RequestStatus::Finished,
        };
        RequestOutput {
            request_id: self.request_id,
            status,
            prompt_len: self.prompt_len(),
            outputs: self
                .seqs
                .iter()
                .enumerate()
                .map(|(index, seq)| CompletionOutput {
                    index,
                    token_ids: seq.output_token_ids().to_vec(),
                    finish_reason: seq.finish_reason(),
                })
                .collect(),
            num_preemptions: self.num_preemptions,
        }
    }
}
