//! Runtime controls for jobs that currently own a worker task.
//!
//! Each live job has exactly one [`JobControl`]: its cancellation token and,
//! while a child process runs, a handle to that process. The whole table is
//! guarded by a single lock.

use crate::process::ProcessHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Per-job runtime control
#[derive(Debug, Clone)]
pub struct JobControl {
    /// One-shot cancellation signal, never reset once set
    pub cancel: CancellationToken,
    /// Child process currently driven by the job, if any
    pub process: Option<ProcessHandle>,
}

/// Result of a cancellation request against a registered job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    /// True if cancellation had already been requested before this call
    pub already_requested: bool,
    /// Process to signal; only present on the first request
    pub process: Option<ProcessHandle>,
}

/// Table of live job controls
#[derive(Debug, Default)]
pub struct JobRegistry {
    controls: Mutex<HashMap<String, JobControl>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job and return its cancellation token.
    ///
    /// Registering an id that is already present returns the existing token.
    pub fn register(&self, job_id: &str) -> CancellationToken {
        let mut controls = self.controls.lock();
        controls
            .entry(job_id.to_string())
            .or_insert_with(|| JobControl {
                cancel: CancellationToken::new(),
                process: None,
            })
            .cancel
            .clone()
    }

    pub fn set_process(&self, job_id: &str, process: ProcessHandle) {
        if let Some(control) = self.controls.lock().get_mut(job_id) {
            control.process = Some(process);
        }
    }

    pub fn clear_process(&self, job_id: &str) {
        if let Some(control) = self.controls.lock().get_mut(job_id) {
            control.process = None;
        }
    }

    pub fn process(&self, job_id: &str) -> Option<ProcessHandle> {
        self.controls
            .lock()
            .get(job_id)
            .and_then(|control| control.process)
    }

    /// Set the job's cancellation flag.
    ///
    /// Returns `None` when the job has no registered control. Idempotent: a
    /// repeated request reports `already_requested` and returns no process so
    /// callers never signal twice.
    pub fn request_cancel(&self, job_id: &str) -> Option<CancelRequest> {
        let controls = self.controls.lock();
        let control = controls.get(job_id)?;

        if control.cancel.is_cancelled() {
            return Some(CancelRequest {
                already_requested: true,
                process: None,
            });
        }

        control.cancel.cancel();
        Some(CancelRequest {
            already_requested: false,
            process: control.process,
        })
    }

    /// Remove a job's control. Absent ids are ignored.
    pub fn unregister(&self, job_id: &str) {
        self.controls.lock().remove(job_id);
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.controls.lock().contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.controls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.lock().is_empty()
    }
}
