//! Shared plumbing for the pipeline phases of one job: the job log, the
//! cancellation checkpoint and the tagged result every phase returns.

use crate::jobs::{JobStatus, JobStore, JobUpdate};
use crate::process::Supervisor;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Logged the first time a job notices its cancellation flag
pub const CANCEL_ACKNOWLEDGED: &str = "Cancellation acknowledged; stopping job.";

/// Why a phase stopped the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abort {
    /// Fatal error; the message becomes the job's failure message
    Failed(String),
    /// The user asked for the job to stop
    Cancelled,
}

impl Abort {
    pub fn failed(message: impl Into<String>) -> Self {
        Abort::Failed(message.into())
    }
}

pub type PhaseResult<T> = Result<T, Abort>;

/// Writes a job's log lines to the store and mirrors them to tracing.
///
/// Store write failures are reported through tracing only; a job never
/// aborts because its log could not be written.
#[derive(Clone)]
pub struct JobLog {
    store: Arc<dyn JobStore>,
    job_id: String,
}

impl JobLog {
    pub fn new(store: Arc<dyn JobStore>, job_id: &str) -> Self {
        Self {
            store,
            job_id: job_id.to_string(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    fn append(&self, line: &str) {
        if let Err(e) = self.store.append_log(&self.job_id, line) {
            warn!(job_id = %self.job_id, error = %e, "failed to append job log");
        }
    }

    pub fn info(&self, message: &str) {
        info!(job_id = %self.job_id, "{}", message);
        self.append(message);
    }

    pub fn warn(&self, message: &str) {
        warn!(job_id = %self.job_id, "{}", message);
        self.append(&format!("WARNING: {}", message));
    }

    pub fn error(&self, message: &str) {
        error!(job_id = %self.job_id, "{}", message);
        self.append(&format!("ERROR: {}", message));
    }

    pub fn debug(&self, message: &str) {
        debug!(job_id = %self.job_id, "{}", message);
        self.append(&format!("DEBUG: {}", message));
    }

    /// Overwrite the newest log line (progress bars)
    pub fn replace_last(&self, line: &str) {
        debug!(job_id = %self.job_id, "{}", line);
        if let Err(e) = self.store.replace_last_log(&self.job_id, line) {
            warn!(job_id = %self.job_id, error = %e, "failed to replace job log");
        }
    }

    /// Append a tool output line verbatim
    pub fn raw(&self, line: &str) {
        debug!(job_id = %self.job_id, "{}", line);
        self.append(line);
    }

    pub fn progress(&self, value: f64) {
        if let Err(e) = self
            .store
            .set_status(&self.job_id, JobStatus::Processing, Some(value))
        {
            warn!(job_id = %self.job_id, error = %e, "failed to record progress");
        }
    }

    pub fn update(&self, update: JobUpdate) {
        if let Err(e) = self.store.update(&self.job_id, update) {
            warn!(job_id = %self.job_id, error = %e, "failed to update job");
        }
    }
}

/// Everything a phase needs: log, cancellation and the process supervisor
pub struct PhaseContext {
    pub log: JobLog,
    pub supervisor: Supervisor,
    pub debug_mode: bool,
    cancel: CancellationToken,
    acknowledged: AtomicBool,
}

impl PhaseContext {
    pub fn new(log: JobLog, supervisor: Supervisor, debug_mode: bool) -> Self {
        let cancel = supervisor.cancel_token().clone();
        Self {
            log,
            supervisor,
            debug_mode,
            cancel,
            acknowledged: AtomicBool::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Log the acknowledgement line, at most once per job
    pub fn acknowledge_cancellation(&self) {
        if !self.acknowledged.swap(true, Ordering::SeqCst) {
            self.log.info(CANCEL_ACKNOWLEDGED);
        }
    }

    /// Stop here if cancellation has been requested.
    pub fn checkpoint(&self) -> PhaseResult<()> {
        if self.cancel.is_cancelled() {
            self.acknowledge_cancellation();
            return Err(Abort::Cancelled);
        }
        Ok(())
    }

    /// Acknowledge and return the cancellation abort
    pub fn cancelled<T>(&self) -> PhaseResult<T> {
        self.acknowledge_cancellation();
        Err(Abort::Cancelled)
    }

    /// Await `fut` unless cancellation arrives first
    pub async fn or_cancel<F>(&self, fut: F) -> PhaseResult<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            output = fut => Ok(output),
            _ = self.cancel.cancelled() => self.cancelled(),
        }
    }
}
