//! Thread-safe front door to an engine running on its own thread.
//!
//! [`spawn_engine`] moves an [`LLMEngine`] onto a dedicated thread. Any
//! number of tasks can then submit and cancel through clones of the
//! returned [`EngineHandle`] and await results. The loop sleeps while idle
//! and exits once every handle is dropped and all accepted work is done.

use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::error;

use super::executor::ExecutionEngine;
use super::llm::{LLMEngine, Submitter};
use crate::config::EngineConfig;
use crate::core::request::{GenerationRequest, RequestId, RequestOutput};
use crate::error::{Error, Result};

/// Clonable handle to a running engine loop.
#[derive(Clone)]
pub struct EngineHandle {
    submitter: Submitter,
}

impl EngineHandle {
    /// Submit a request.
    ///
    /// Validation happens here, synchronously. The receiver resolves to the
    /// request's terminal result, exactly once.
    pub fn submit(
        &self,
        request: GenerationRequest,
    ) -> Result<(RequestId, oneshot::Receiver<RequestOutput>)> {
        let (tx, rx) = oneshot::channel();
        let request_id = self.submitter.send_request(request, Some(tx))?;
        Ok((request_id, rx))
    }

    /// Submit a request and wait for its result.
    pub async fn generate(&self, request: GenerationRequest) -> Result<RequestOutput> {
        let (_, rx) = self.submit(request)?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Cancel a request at the engine's next step.
    ///
    /// The receiver resolves to `true` if the cancellation changed the
    /// request's state, `false` if it was unknown or already terminal.
    pub fn cancel(&self, request_id: RequestId) -> Result<oneshot::Receiver<bool>> {
        let (tx, rx) = oneshot::channel();
        self.submitter.send_cancel(request_id, Some(tx))?;
        Ok(rx)
    }

    /// The underlying fire-and-forget producer.
    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }
}

/// Start the engine loop on a dedicated thread.
///
/// The thread returns when every [`EngineHandle`] clone is dropped and all
/// accepted requests are done, or on the first internal error.
pub fn spawn_engine<E>(
    config: EngineConfig,
    executor: E,
) -> Result<(EngineHandle, JoinHandle<Result<()>>)>
where
    E: ExecutionEngine + Send + 'static,
{
    let mut engine = LLMEngine::new(config, executor)?;
    let submitter = engine.detach_submitter()?;

    let thread = std::thread::Builder::new()
        .name("inflight-engine".to_string())
        .spawn(move || {
            let result = engine.run_until_closed();
            if let Err(e) = &result {
                error!(error = %e, "engine loop failed");
            }
            result
        })?;

    Ok((EngineHandle { submitter }, thread))
}
