//! Submit / poll / retrieve for a single engine job.
//!
//! `Idle -> Submitted -> Polling -> {Completed | Failed | TimedOut}`. A job is
//! submitted exactly once; polling only reads history. Abandoning the loop
//! does not cancel the job on the engine side.

use std::convert::Infallible;

use tracing::{debug, info, warn};

use crate::engine::{EngineApi, EngineError, JobHandle, Outputs};
use crate::error::WorkerError;
use crate::retry::{poll_bounded, Attempt, Polled, RetryPolicy};
use crate::workflow::Workflow;

/// What one look at the history says.
#[derive(Debug, PartialEq)]
pub enum PollState {
    Pending,
    Completed(Outputs),
    Failed(String),
}

/// Terminal state of the polling loop.
#[derive(Debug, PartialEq)]
pub enum JobOutcome {
    Completed(Outputs),
    Failed(String),
    TimedOut { attempts: u32 },
}

pub struct JobController<'a, E: EngineApi + ?Sized> {
    engine: &'a E,
    policy: RetryPolicy,
}

impl<'a, E: EngineApi + ?Sized> JobController<'a, E> {
    pub fn new(engine: &'a E, policy: RetryPolicy) -> Self {
        Self { engine, policy }
    }

    /// Queue the workflow. Never retried here.
    pub async fn submit(&self, workflow: &Workflow) -> Result<JobHandle, WorkerError> {
        self.engine.submit(workflow).await.map_err(WorkerError::Submission)
    }

    /// One history lookup. A missing entry, or one without an `outputs`
    /// section, is still pending.
    pub async fn poll(&self, handle: &JobHandle) -> Result<PollState, EngineError> {
        let Some(entry) = self.engine.history(handle).await? else {
            return Ok(PollState::Pending);
        };
        if let Some(status) = entry.status.as_ref().filter(|s| s.is_error()) {
            return Ok(PollState::Failed(status.error_message()));
        }
        Ok(match entry.outputs {
            Some(outputs) => PollState::Completed(outputs),
            None => PollState::Pending,
        })
    }

    /// Poll until the job finishes or the attempt budget is spent. Transport
    /// errors count as a pending attempt.
    pub async fn await_outcome(&self, handle: &JobHandle) -> JobOutcome {
        let polled = poll_bounded(self.policy, |attempt| async move {
            match self.poll(handle).await {
                Ok(PollState::Pending) => {
                    debug!(prompt_id = %handle, attempt, "job still running");
                    Ok::<_, Infallible>(Attempt::Pending)
                }
                Ok(PollState::Completed(outputs)) => Ok(Attempt::Done(Ok(outputs))),
                Ok(PollState::Failed(message)) => Ok(Attempt::Done(Err(message))),
                Err(e) => {
                    warn!(prompt_id = %handle, attempt, error = %e, "history lookup failed");
                    Ok(Attempt::Pending)
                }
            }
        })
        .await;

        let polled = match polled {
            Ok(polled) => polled,
            Err(never) => match never {},
        };
        match polled {
            Polled::Ready(Ok(outputs)) => {
                info!(prompt_id = %handle, nodes = outputs.len(), "job completed");
                JobOutcome::Completed(outputs)
            }
            Polled::Ready(Err(message)) => {
                warn!(prompt_id = %handle, %message, "job failed on the engine");
                JobOutcome::Failed(message)
            }
            Polled::TimedOut { attempts } => {
                warn!(prompt_id = %handle, attempts, "gave up waiting for job");
                JobOutcome::TimedOut { attempts }
            }
        }
    }

    /// Submit, then wait for the outputs.
    pub async fn run(&self, workflow: &Workflow) -> Result<(JobHandle, Outputs), WorkerError> {
        let handle = self.submit(workflow).await?;
        match self.await_outcome(&handle).await {
            JobOutcome::Completed(outputs) => Ok((handle, outputs)),
            JobOutcome::Failed(message) => Err(WorkerError::ExecutionFailed(message)),
            JobOutcome::TimedOut { .. } => Err(WorkerError::PollTimeout),
        }
    }
}
