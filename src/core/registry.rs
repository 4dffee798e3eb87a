//! Registry of live requests.
//!
//! A request is owned by the registry from submission until its terminal
//! result has been drained. Terminal results are handed out exactly once:
//! draining removes the entry.

use std::collections::HashMap;

use crate::core::request::{GenerationRequest, Request, RequestId, RequestOutput, RequestState};
use crate::core::sequence::SequenceId;
use crate::error::{Error, Result};

/// All requests that have not yet been delivered.
#[derive(Debug, Default)]
pub struct Registry {
    requests: HashMap<RequestId, Request>,
    /// Requests that reached a terminal state, in completion order.
    finished: Vec<RequestId>,
    next_request_id: RequestId,
    next_seq_id: SequenceId,
    next_arrival: u64,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id for [`insert`](Self::insert).
    pub fn next_request_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Allocate a fresh sequence id.
    pub fn next_seq_id(&mut self) -> SequenceId {
        let id = self.next_seq_id;
        self.next_seq_id += 1;
        id
    }

    /// Register a request under `request_id` and return its arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the id is already in use.
    pub fn insert(
        &mut self,
        request_id: RequestId,
        request: GenerationRequest,
        block_size: usize,
    ) -> Result<u64> {
        if self.requests.contains_key(&request_id) {
            return Err(Error::InvalidRequest(format!(
                "request id {request_id} already in use"
            )));
        }
        let arrival_order = self.next_arrival;
        self.next_arrival += 1;
        let seq_id = self.next_seq_id();
        self.requests.insert(
            request_id,
            Request::new(request_id, request, arrival_order, seq_id, block_size),
        );
        Ok(arrival_order)
    }

    pub fn get(&self, request_id: RequestId) -> Option<&Request> {
        self.requests.get(&request_id)
    }

    pub fn get_mut(&mut self, request_id: RequestId) -> Option<&mut Request> {
        self.requests.get_mut(&request_id)
    }

    /// Like [`get_mut`](Self::get_mut) but a missing id is an error.
    pub fn require_mut(&mut self, request_id: RequestId) -> Result<&mut Request> {
        self.requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.requests.contains_key(&request_id)
    }

    /// Number of requests not yet drained.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.values()
    }

    /// Move a request into a terminal state and queue its result.
    ///
    /// The caller must already have released the request's blocks.
    pub fn finish(&mut self, request_id: RequestId, to: RequestState) -> Result<()> {
        debug_assert!(to.is_terminal());
        self.require_mut(request_id)?.transition(to)?;
        self.finished.push(request_id);
        Ok(())
    }

    /// Number of terminal results waiting to be drained.
    pub fn num_finished(&self) -> usize {
        self.finished.len()
    }

    /// Remove every terminal request and return its result.
    pub fn drain_finished(&mut self) -> Vec<RequestOutput> {
        let finished = std::mem::take(&mut self.finished);
        finished
            .into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .map(|req| req.to_output())
            .collect()
    }
}
