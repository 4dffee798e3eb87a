//! Engine driver.
//!
//! The LLMEngine owns the scheduler and an execution engine and runs the
//! step loop:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LLMEngine::step                        │
//! └─────────────────────────────────────────────────────────────┘
//!
//!   Submitter ──► inbox ──► drain (submit / cancel)
//!                                   │
//!                                   ▼
//!                         ┌──────────────────┐
//!                         │    Scheduler     │
//!                         │    schedule()    │
//!                         └──────────────────┘
//!                                   │ BatchDescriptor
//!                                   ▼
//!                         ┌──────────────────┐
//!                         │ ExecutionEngine  │
//!                         │    run_step()    │
//!                         └──────────────────┘
//!                                   │ StepOutput
//!                                   ▼
//!                         ┌──────────────────┐
//!                         │    Scheduler     │
//!                         │ process_output() │
//!                         └──────────────────┘
//!                                   │
//!                                   ▼
//!                      finished requests, delivered once
//! ```
//!
//! Submissions and cancellations from any thread travel through the inbox
//! and only take effect at the start of a step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument};

use super::executor::ExecutionEngine;
use crate::config::EngineConfig;
use crate::core::request::{GenerationRequest, RequestId, RequestOutput};
use crate::error::{Error, Result};
use crate::scheduler::{validate_request, Scheduler, SchedulerStats};

/// Message consumed by the engine at a step boundary.
pub(crate) enum Command {
    Submit {
        request_id: RequestId,
        request: GenerationRequest,
        reply: Option<oneshot::Sender<RequestOutput>>,
    },
    Cancel {
        request_id: RequestId,
        ack: Option<oneshot::Sender<bool>>,
    },
}

/// Clonable producer of submissions and cancellations.
///
/// Requests are validated and given their id on the calling thread; the
/// engine picks them up at its next step.
#[derive(Clone)]
pub struct Submitter {
    tx: mpsc::UnboundedSender<Command>,
    next_request_id: Arc<AtomicU64>,
    config: Arc<EngineConfig>,
}

impl Submitter {
    /// Validate and send a request.
    ///
    /// # Errors
    ///
    /// Validation errors from
    /// [`validate_request`](crate::scheduler::validate_request), or
    /// [`Error::EngineStopped`] if the engine is gone.
    pub fn submit(&self, request: GenerationRequest) -> Result<RequestId> {
        self.send_request(request, None)
    }

    /// Ask the engine to cancel a request at its next step.
    pub fn cancel(&self, request_id: RequestId) -> Result<()> {
        self.send_cancel(request_id, None)
    }

    pub(crate) fn send_request(
        &self,
        request: GenerationRequest,
        reply: Option<oneshot::Sender<RequestOutput>>,
    ) -> Result<RequestId> {
        validate_request(&self.config, &request)?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Command::Submit {
                request_id,
                request,
                reply,
            })
            .map_err(|_| Error::EngineStopped)?;
        Ok(request_id)
    }

    pub(crate) fn send_cancel(
        &self,
        request_id: RequestId,
        ack: Option<oneshot::Sender<bool>>,
    ) -> Result<()> {
        self.tx
            .send(Command::Cancel { request_id, ack })
            .map_err(|_| Error::EngineStopped)
    }
}

/// Continuous batching engine.
///
/// Orchestrates the scheduler and an execution engine.
///
/// # Example
///
/// ```
/// use inflight_batcher::config::EngineConfig;
/// use inflight_batcher::core::request::{GenerationRequest, RequestStatus};
/// use inflight_batcher::engine::{LLMEngine, SyntheticEngine};
///
/// let config = EngineConfig::default();
/// let executor = SyntheticEngine::new(&config, 42);
/// let mut engine = LLMEngine::new(config, executor).unwrap();
///
/// engine
///     .add_request(GenerationRequest::new(vec![1, 2, 3]).max_new_tokens(4))
///     .unwrap();
/// let outputs = engine.generate().unwrap();
///
/// assert_eq!(outputs.len(), 1);
/// assert_eq!(outputs[0].status, RequestStatus::Finished);
/// assert_eq!(outputs[0].outputs[0].token_ids.len(), 4);
/// ```
pub struct LLMEngine<E> {
    scheduler: Scheduler,
    executor: E,
    inbox: mpsc::UnboundedReceiver<Command>,
    /// Local producer, taken away when the engine moves to its own thread.
    submitter: Option<Submitter>,
    /// Result channels of requests submitted through a handle.
    waiters: HashMap<RequestId, oneshot::Sender<RequestOutput>>,
}

impl<E: ExecutionEngine> LLMEngine<E> {
    /// Create a new engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration does not validate.
    pub fn new(config: EngineConfig, executor: E) -> Result<Self> {
        let scheduler = Scheduler::new(&config)?;
        let (tx, inbox) = mpsc::unbounded_channel();
        let submitter = Submitter {
            tx,
            next_request_id: Arc::new(AtomicU64::new(0)),
            config: Arc::new(config),
        };
        Ok(Self {
            scheduler,
            executor,
            inbox,
            submitter: Some(submitter),
            waiters: HashMap::new(),
        })
    }

    /// A producer other threads can use to feed this engine.
    pub fn submitter(&self) -> Result<Submitter> {
        self.submitter.clone().ok_or(Error::EngineStopped)
    }

    /// Hand the local producer to the caller. The inbox closes once every
    /// clone of it is dropped.
    pub(crate) fn detach_submitter(&mut self) -> Result<Submitter> {
        self.submitter.take().ok_or(Error::EngineStopped)
    }

    /// Add a generation request to the engine.
    ///
    /// Returns the assigned request ID. The request is queued at the next
    /// step.
    pub fn add_request(&mut self, request: GenerationRequest) -> Result<RequestId> {
        self.submitter
            .as_ref()
            .ok_or(Error::EngineStopped)?
            .submit(request)
    }

    /// Cancel a request at the next step boundary.
    pub fn cancel(&mut self, request_id: RequestId) -> Result<()> {
        self.submitter
            .as_ref()
            .ok_or(Error::EngineStopped)?
            .cancel(request_id)
    }

    /// Run a single step.
    ///
    /// Returns the results of every request that reached a terminal state
    /// during the step, including ones cancelled at its start.
    #[instrument(skip_all)]
    pub fn step(&mut self) -> Result<Vec<RequestOutput>> {
        self.drain_inbox()?;

        let batch = self.scheduler.schedule()?;
        if !batch.is_empty() {
            let result = self.executor.run_step(&batch);
            self.scheduler.process_output(&batch, result)?;
        }

        let outputs = self.scheduler.drain_finished();
        for output in &outputs {
            debug!(request_id = output.request_id, status = ?output.status, "request done");
            if let Some(waiter) = self.waiters.remove(&output.request_id) {
                // The caller may have stopped listening.
                let _ = waiter.send(output.clone());
            }
        }
        Ok(outputs)
    }

    /// Step until every submitted request has finished.
    pub fn generate(&mut self) -> Result<Vec<RequestOutput>> {
        let mut outputs = Vec::new();
        loop {
            self.drain_inbox()?;
            if !self.has_pending_requests() {
                break;
            }
            outputs.extend(self.step()?);
        }
        Ok(outputs)
    }

    /// Whether any accepted request has not been delivered yet.
    ///
    /// Commands still in the inbox are not counted.
    pub fn has_pending_requests(&self) -> bool {
        self.scheduler.has_pending_requests() || self.scheduler.has_unfinished_requests()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn drain_inbox(&mut self) -> Result<()> {
        while let Ok(command) = self.inbox.try_recv() {
            self.apply(command)?;
        }
        Ok(())
    }

    fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Submit {
                request_id,
                request,
                reply,
            } => {
                self.scheduler.insert_request(request_id, request)?;
                if let Some(reply) = reply {
                    self.waiters.insert(request_id, reply);
                }
            }
            Command::Cancel { request_id, ack } => {
                let cancelled = self.scheduler.cancel(request_id)?;
                if let Some(ack) = ack {
                    let _ = ack.send(cancelled);
                }
            }
        }
        Ok(())
    }

    /// Serve the inbox until every producer is gone and all work is done.
    ///
    /// Blocks the calling thread while idle; must not run inside an async
    /// runtime.
    pub(crate) fn run_until_closed(&mut self) -> Result<()> {
        loop {
            if !self.has_pending_requests() {
                match self.inbox.blocking_recv() {
                    Some(command) => self.apply(command)?,
                    None => break,
                }
            }
            self.step()?;
        }
        info!(stats = ?self.stats(), "engine loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::RequestStatus;
    use crate::engine::SyntheticEngine;

    fn engine() -> LLMEngine<SyntheticEngine> {
        let mut config = EngineConfig::default();
        config.cache.block_size = 4;
        config.cache.num_blocks = 32;
        let executor = SyntheticEngine::new(&config, 0);
        LLMEngine::new(config, executor).unwrap()
    }

    #[test]
    fn test_requests_wait_for_step_boundary() {
        let mut engine = engine();
        engine.add_request(GenerationRequest::new(vec![1, 2])).unwrap();

        // Still in the inbox
        assert!(!engine.has_pending_requests());
        assert_eq!(engine.stats().num_waiting, 0);

        engine.step().unwrap();
        assert_eq!(engine.stats().num_running, 1);
    }

    #[test]
    fn test_generate_runs_to_completion() {
        let mut engine = engine();
        for len in 1..=5 {
            engine
                .add_request(GenerationRequest::new(vec![7; len]).max_new_tokens(len))
                .unwrap();
        }

        let outputs = engine.generate().unwrap();
        assert_eq!(outputs.len(), 5);
        for output in &outputs {
            assert_eq!(output.status, RequestStatus::Finished);
            assert_eq!(output.outputs[0].token_ids.len(), output.prompt_len);
        }
        assert!(!engine.has_pending_requests());
        assert_eq!(engine.stats().num_free_blocks, 32);
    }

    #[test]
    fn test_cancel_before_admission() {
        let mut engine = engine();
        let id = engine.add_request(GenerationRequest::new(vec![1, 2])).unwrap();
        engine.cancel(id).unwrap();

        let outputs = engine.step().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].status, RequestStatus::Cancelled);
        assert_eq!(engine.executor().steps(), 0);
    }

    #[test]
    fn test_invalid_request_rejected_synchronously() {
        let mut engine = engine();
        assert!(matches!(
            engine.add_request(GenerationRequest::new(vec![])),
            Err(Error::InvalidRequest(_))
        ));
    }
}
