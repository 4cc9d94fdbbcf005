//! Blocking wait on remote jobs.

use crate::error::{QaError, Result};
use crate::rapi::{ClusterApi, JobId, JobState, JobStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cooperative cancellation shared with the signal handler thread.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The raw flag, for `signal_hook::flag::register`.
    pub fn as_atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Waits for remote jobs to reach a terminal state.
///
/// There is no timeout: a job that never finishes is a fault of the remote
/// service. The only way out of a wait is the cancel flag.
pub struct JobPoller<'a> {
    api: &'a dyn ClusterApi,
    period: Duration,
    cancel: CancelFlag,
}

impl<'a> JobPoller<'a> {
    pub fn new(api: &'a dyn ClusterApi, period: Duration, cancel: CancelFlag) -> Self {
        Self {
            api,
            period,
            cancel,
        }
    }

    pub fn api(&self) -> &'a dyn ClusterApi {
        self.api
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Block until `job` is terminal and return its final status.
    pub fn wait_status(&self, job: JobId) -> Result<JobStatus> {
        let started = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                warn!(job_id = job, "stopped waiting on job: cancelled");
                return Err(QaError::Cancelled);
            }
            let status = self.api.job_status(job)?;
            if status.state.is_terminal() {
                debug!(
                    job_id = job,
                    state = ?status.state,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job finished"
                );
                return Ok(status);
            }
            thread::sleep(self.period);
        }
    }

    /// `true` only if the job succeeded.
    pub fn wait(&self, job: JobId) -> Result<bool> {
        Ok(self.wait_status(job)?.state == JobState::Success)
    }

    /// Wait and turn a failed job into [`QaError::RemoteOperationFailed`].
    pub fn wait_for(&self, job: JobId, operation: &str, target: &str) -> Result<()> {
        let status = self.wait_status(job)?;
        if status.state == JobState::Success {
            return Ok(());
        }
        Err(QaError::remote(operation, target, status.failure_detail()))
    }
}
