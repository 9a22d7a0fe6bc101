//! Job records and the store that persists them.
//!
//! The orchestrator only talks to the [`JobStore`] trait. [`JsonJobStore`]
//! keeps every job in memory and mirrors the whole list to a single JSON
//! state file. Log lines and progress ticks are coalesced into at most one
//! save per [`SAVE_INTERVAL`]; every other write is saved immediately.

use crate::naming::ExtraType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Message stored on jobs interrupted by a daemon restart
pub const INTERRUPTED_MESSAGE: &str = "Interrupted by daemon restart.";

/// Minimum spacing between saves triggered by log lines and progress ticks
pub const SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its worker to start.
    Queued,
    /// Worker is running the pipeline.
    Processing,
    /// File saved into the library.
    Success,
    /// Pipeline stopped on a fatal error.
    Failed,
    /// Stopped on user request.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    /// Terminal statuses are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Something adjusted while normalizing a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestNotice {
    Warning(String),
    Info(String),
}

/// Download request as submitted, canonicalized in place by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobRequest {
    /// Source video or playlist URL
    pub url: String,
    /// Catalog movie id
    pub movie_id: String,
    /// Display name of the chosen movie
    pub movie_name: String,
    pub title: String,
    pub year: String,
    /// TMDb id used when no movie id is given
    pub tmdb: String,
    /// Store as extra content in a subfolder of the movie
    pub extra: bool,
    pub extra_type: String,
    pub extra_name: String,
    /// `single` or `merge`
    pub playlist_mode: String,
    /// Download outside the catalog into a library root
    pub standalone: bool,
    /// `youtube` (source title) or `custom`
    pub standalone_name_mode: String,
    pub standalone_custom_name: String,
}

impl JobRequest {
    pub fn merge_playlist(&self) -> bool {
        self.playlist_mode.trim().eq_ignore_ascii_case("merge")
    }

    pub fn custom_standalone_name(&self) -> Option<&str> {
        let name = self.standalone_custom_name.trim();
        (self.standalone && self.standalone_name_mode == "custom" && !name.is_empty())
            .then_some(name)
    }

    /// Canonicalize every free-form field.
    ///
    /// Invalid playlist modes fall back to `single`, unknown extra types to
    /// `other`, and standalone requests never carry extra settings. Returns
    /// what was adjusted so the caller can log it.
    pub fn normalize(&mut self) -> Vec<RequestNotice> {
        let mut notices = Vec::new();

        let mode = self.playlist_mode.trim().to_lowercase();
        self.playlist_mode = match mode.as_str() {
            "" | "single" => "single".to_string(),
            "merge" => "merge".to_string(),
            other => {
                notices.push(RequestNotice::Warning(format!(
                    "Invalid playlist mode '{}', defaulting to single video.",
                    other
                )));
                "single".to_string()
            }
        };

        let name_mode = self.standalone_name_mode.trim().to_lowercase();
        self.standalone_name_mode = if name_mode == "custom" {
            name_mode
        } else {
            "youtube".to_string()
        };
        self.standalone_custom_name = self.standalone_custom_name.trim().to_string();
        if !self.standalone {
            self.standalone_name_mode = "youtube".to_string();
            self.standalone_custom_name.clear();
        } else if self.standalone_name_mode == "custom" && self.standalone_custom_name.is_empty() {
            notices.push(RequestNotice::Warning(
                "Custom standalone name requested without a value. Falling back to YouTube title."
                    .to_string(),
            ));
            self.standalone_name_mode = "youtube".to_string();
        }

        let extra_type = self.extra_type.trim();
        let resolved = if extra_type.is_empty() {
            ExtraType::Trailer
        } else if let Some(found) = ExtraType::parse(extra_type) {
            found
        } else {
            notices.push(RequestNotice::Info(format!(
                "Unknown extra type '{}', defaulting to 'other'.",
                extra_type
            )));
            ExtraType::Other
        };
        self.extra_type = resolved.key().to_string();

        if self.standalone {
            self.extra = false;
        }
        self.extra_name = if self.extra {
            self.extra_name.trim().to_string()
        } else {
            String::new()
        };

        for field in [
            &mut self.url,
            &mut self.movie_id,
            &mut self.movie_name,
            &mut self.title,
            &mut self.year,
            &mut self.tmdb,
        ] {
            *field = field.trim().to_string();
        }

        notices
    }
}

/// A download job with its full history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: String,
    pub status: JobStatus,
    /// Percentage in [0, 100].
    pub progress: f64,
    pub label: String,
    pub subtitle: String,
    pub metadata: Vec<String>,
    /// Short status text, e.g. the failure cause.
    pub message: String,
    #[serde(default)]
    pub logs: Vec<String>,
    pub request: JobRequest,
    /// Unix timestamp (milliseconds) when job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when job was last updated.
    pub updated_at: i64,
}

impl Job {
    /// New queued job with a fresh UUID and the initial log line.
    pub fn new(request: JobRequest) -> Self {
        let descriptor = crate::naming::describe_job(&request);
        let now = current_timestamp_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            progress: 0.0,
            label: descriptor.label,
            subtitle: descriptor.subtitle,
            metadata: descriptor.metadata,
            message: String::new(),
            logs: vec!["Job queued.".to_string()],
            request,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn without_logs(&self) -> Job {
        Job {
            logs: Vec::new(),
            ..self.clone()
        }
    }
}

/// Partial update of a job's descriptive fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub label: Option<String>,
    pub subtitle: Option<String>,
    pub metadata: Option<Vec<String>>,
    pub message: Option<String>,
    pub request: Option<JobRequest>,
}

/// Error type for job persistence
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("failed to persist jobs to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to load jobs from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Storage contract used by the daemon and the orchestrator.
///
/// Implementations are internally synchronized. Writes that would change the
/// status of a terminal job are ignored.
pub trait JobStore: Send + Sync {
    fn create(&self, job: Job) -> Result<Job, StoreError>;
    fn update(&self, id: &str, update: JobUpdate) -> Result<(), StoreError>;
    fn append_log(&self, id: &str, line: &str) -> Result<(), StoreError>;
    fn replace_last_log(&self, id: &str, line: &str) -> Result<(), StoreError>;
    fn set_status(&self, id: &str, status: JobStatus, progress: Option<f64>)
        -> Result<(), StoreError>;
    fn mark_success(&self, id: &str) -> Result<(), StoreError>;
    fn mark_failure(&self, id: &str, message: &str) -> Result<(), StoreError>;
    fn mark_cancelled(&self, id: &str, message: &str) -> Result<(), StoreError>;
    /// Snapshot of one job, optionally without its log lines
    fn get(&self, id: &str, include_logs: bool) -> Option<Job>;
    /// All jobs newest first, without log lines
    fn list(&self) -> Vec<Job>;
    /// Write out anything held back by coalesced saves
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Save {
    Now,
    Coalesced,
}

#[derive(Debug, Default)]
struct SaveState {
    last: Option<Instant>,
    dirty: bool,
}

/// In-memory job list mirrored to a JSON state file
#[derive(Debug)]
pub struct JsonJobStore {
    path: Option<PathBuf>,
    max_items: usize,
    max_logs: usize,
    jobs: Mutex<Vec<Job>>,
    saves: Mutex<SaveState>,
}

impl JsonJobStore {
    /// Open the store backed by `path`, loading any jobs it already holds.
    ///
    /// Jobs left queued or processing by a previous run have no worker any
    /// more and are marked failed.
    pub fn open(path: &Path, max_items: usize, max_logs: usize) -> Result<Self, StoreError> {
        let mut jobs = load_jobs(path).map_err(|source| StoreError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        let mut recovered = 0;
        for job in jobs.iter_mut().filter(|j| j.status.is_active()) {
            job.status = JobStatus::Failed;
            job.message = INTERRUPTED_MESSAGE.to_string();
            job.logs.push(format!("ERROR: {}", INTERRUPTED_MESSAGE));
            job.touch();
            recovered += 1;
        }
        if recovered > 0 {
            warn!(count = recovered, "marked interrupted jobs as failed");
        }

        let store = Self {
            path: Some(path.to_path_buf()),
            max_items,
            max_logs,
            jobs: Mutex::new(jobs),
            saves: Mutex::new(SaveState::default()),
        };
        if recovered > 0 {
            store.persist(&store.jobs.lock(), Save::Now)?;
        }
        Ok(store)
    }

    /// Store without a backing file
    pub fn in_memory(max_items: usize, max_logs: usize) -> Self {
        Self {
            path: None,
            max_items,
            max_logs,
            jobs: Mutex::new(Vec::new()),
            saves: Mutex::new(SaveState::default()),
        }
    }

    /// Save the list, or only mark it dirty when a coalesced save comes
    /// within [`SAVE_INTERVAL`] of the previous one. Callers hold the jobs lock.
    fn persist(&self, jobs: &[Job], save: Save) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut saves = self.saves.lock();
        let recent = saves.last.is_some_and(|at| at.elapsed() < SAVE_INTERVAL);
        if save == Save::Coalesced && recent {
            saves.dirty = true;
            return Ok(());
        }
        save_jobs(jobs, path).map_err(|source| StoreError::Persist {
            path: path.clone(),
            source,
        })?;
        saves.last = Some(Instant::now());
        saves.dirty = false;
        Ok(())
    }

    /// Apply `f` to one job under the lock, then persist the list
    fn modify<F>(&self, id: &str, save: Save, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(job);
        job.touch();
        self.persist(&jobs, save)
    }

    fn cap_logs(&self, job: &mut Job) {
        if self.max_logs > 0 && job.logs.len() > self.max_logs {
            let excess = job.logs.len() - self.max_logs;
            job.logs.drain(..excess);
        }
    }

    /// Drop the oldest terminal jobs beyond the item cap
    fn cap_items(&self, jobs: &mut Vec<Job>) {
        if self.max_items == 0 {
            return;
        }
        while jobs.len() > self.max_items {
            // Oldest entries live at the end
            match jobs.iter().rposition(|j| j.is_terminal()) {
                Some(index) => {
                    jobs.remove(index);
                }
                None => break,
            }
        }
    }
}

impl JobStore for JsonJobStore {
    fn create(&self, mut job: Job) -> Result<Job, StoreError> {
        self.cap_logs(&mut job);
        let mut jobs = self.jobs.lock();
        jobs.insert(0, job.clone());
        self.cap_items(&mut jobs);
        self.persist(&jobs, Save::Now)?;
        Ok(job)
    }

    fn update(&self, id: &str, update: JobUpdate) -> Result<(), StoreError> {
        self.modify(id, Save::Now, |job| {
            if let Some(label) = update.label {
                job.label = label;
            }
            if let Some(subtitle) = update.subtitle {
                job.subtitle = subtitle;
            }
            if let Some(metadata) = update.metadata {
                job.metadata = metadata;
            }
            if let Some(message) = update.message {
                job.message = message;
            }
            if let Some(request) = update.request {
                job.request = request;
            }
        })
    }

    fn append_log(&self, id: &str, line: &str) -> Result<(), StoreError> {
        self.modify(id, Save::Coalesced, |job| {
            job.logs.push(line.to_string());
            self.cap_logs(job);
        })
    }

    fn replace_last_log(&self, id: &str, line: &str) -> Result<(), StoreError> {
        self.modify(id, Save::Coalesced, |job| match job.logs.last_mut() {
            Some(last) => *last = line.to_string(),
            None => job.logs.push(line.to_string()),
        })
    }

    fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        progress: Option<f64>,
    ) -> Result<(), StoreError> {
        let unchanged = self.get(id, false).is_some_and(|j| j.status == status);
        let save = if unchanged { Save::Coalesced } else { Save::Now };
        self.modify(id, save, |job| {
            if job.is_terminal() {
                return;
            }
            job.status = status;
            if let Some(p) = progress {
                job.progress = clamp_progress(p);
            }
        })
    }

    fn mark_success(&self, id: &str) -> Result<(), StoreError> {
        self.modify(id, Save::Now, |job| {
            if job.is_terminal() {
                return;
            }
            job.status = JobStatus::Success;
            job.progress = 100.0;
            job.message.clear();
        })
    }

    fn mark_failure(&self, id: &str, message: &str) -> Result<(), StoreError> {
        self.modify(id, Save::Now, |job| {
            if job.is_terminal() {
                return;
            }
            job.status = JobStatus::Failed;
            job.message = message.to_string();
        })
    }

    fn mark_cancelled(&self, id: &str, message: &str) -> Result<(), StoreError> {
        self.modify(id, Save::Now, |job| {
            if job.is_terminal() {
                return;
            }
            job.status = JobStatus::Cancelled;
            job.message = message.to_string();
        })
    }

    fn get(&self, id: &str, include_logs: bool) -> Option<Job> {
        let jobs = self.jobs.lock();
        let job = jobs.iter().find(|j| j.id == id)?;
        Some(if include_logs {
            job.clone()
        } else {
            job.without_logs()
        })
    }

    fn list(&self) -> Vec<Job> {
        let jobs = self.jobs.lock();
        let mut listed: Vec<Job> = jobs.iter().map(Job::without_logs).collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listed
    }

    fn flush(&self) -> Result<(), StoreError> {
        let jobs = self.jobs.lock();
        if !self.saves.lock().dirty {
            return Ok(());
        }
        self.persist(&jobs, Save::Now)
    }
}

fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Writes the job list to `path` through a temporary sibling file.
///
/// # Arguments
/// * `jobs` - Jobs to save, newest first
/// * `path` - State file path; parent directories are created
pub fn save_jobs(jobs: &[Job], path: &Path) -> Result<(), io::Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(jobs)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

/// Loads the job list from the state file.
///
/// A missing file yields an empty list. An unreadable document is logged and
/// treated as empty rather than blocking startup.
pub fn load_jobs(path: &Path) -> Result<Vec<Job>, io::Error> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<Vec<Job>>(&content) {
        Ok(jobs) => Ok(jobs),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable job state file");
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn make_job(url: &str) -> Job {
        Job::new(JobRequest {
            url: url.to_string(),
            standalone: true,
            ..JobRequest::default()
        })
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Queued),
            Just(JobStatus::Processing),
            Just(JobStatus::Success),
            Just(JobStatus::Failed),
            Just(JobStatus::Cancelled),
        ]
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(format!("{}", JobStatus::Queued), "queued");
        assert_eq!(format!("{}", JobStatus::Processing), "processing");
        assert_eq!(format!("{}", JobStatus::Success), "success");
        assert_eq!(format!("{}", JobStatus::Failed), "failed");
        assert_eq!(format!("{}", JobStatus::Cancelled), "cancelled");
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = make_job("https://youtu.be/x");

        assert_eq!(job.id.len(), 36);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.logs, vec!["Job queued.".to_string()]);
        assert_eq!(job.label, "Standalone Download");
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn test_normalize_defaults() {
        let mut request = JobRequest {
            playlist_mode: "Shuffle".to_string(),
            extra: true,
            extra_type: "Bloopers".to_string(),
            extra_name: "  Gag Reel ".to_string(),
            standalone_name_mode: "custom".to_string(),
            standalone_custom_name: "ignored".to_string(),
            ..JobRequest::default()
        };
        let notices = request.normalize();

        assert_eq!(request.playlist_mode, "single");
        assert_eq!(request.extra_type, "other");
        assert_eq!(request.extra_name, "Gag Reel");
        assert_eq!(request.standalone_name_mode, "youtube");
        assert!(request.standalone_custom_name.is_empty());
        assert_eq!(notices.len(), 2);
        assert!(matches!(notices[0], RequestNotice::Warning(_)));
        assert!(matches!(notices[1], RequestNotice::Info(_)));
    }

    #[test]
    fn test_normalize_accepts_extra_type_variants() {
        for (raw, key) in [
            ("Trailers", "trailer"),
            ("Behind the Scenes", "behindthescenes"),
            ("deleted-scenes", "deleted"),
            ("FEATURETTE", "featurette"),
        ] {
            let mut request = JobRequest {
                extra: true,
                extra_type: raw.to_string(),
                ..JobRequest::default()
            };
            assert!(request.normalize().is_empty(), "{} raised a notice", raw);
            assert_eq!(request.extra_type, key);
        }
    }

    #[test]
    fn test_normalize_standalone_drops_extra() {
        let mut request = JobRequest {
            standalone: true,
            extra: true,
            extra_name: "Teaser".to_string(),
            standalone_name_mode: "CUSTOM".to_string(),
            standalone_custom_name: "   ".to_string(),
            ..JobRequest::default()
        };
        let notices = request.normalize();

        assert!(!request.extra);
        assert!(request.extra_name.is_empty());
        assert_eq!(request.standalone_name_mode, "youtube");
        assert_eq!(request.extra_type, "trailer");
        assert_eq!(notices.len(), 1);
        assert!(request.custom_standalone_name().is_none());
    }

    #[test]
    fn test_terminal_status_is_absorbing() {
        let store = JsonJobStore::in_memory(50, 500);
        let job = store.create(make_job("u")).expect("create");

        store.mark_cancelled(&job.id, "Job cancelled by user.").expect("cancel");
        store.mark_success(&job.id).expect("success ignored");
        store
            .set_status(&job.id, JobStatus::Processing, Some(50.0))
            .expect("status ignored");
        store.mark_failure(&job.id, "late failure").expect("failure ignored");

        let stored = store.get(&job.id, true).expect("job exists");
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.message, "Job cancelled by user.");
        assert_eq!(stored.progress, 0.0);
    }

    #[test]
    fn test_progress_is_clamped() {
        let store = JsonJobStore::in_memory(50, 500);
        let job = store.create(make_job("u")).expect("create");

        store.set_status(&job.id, JobStatus::Processing, Some(250.0)).expect("status");
        assert_eq!(store.get(&job.id, false).map(|j| j.progress), Some(100.0));

        store.set_status(&job.id, JobStatus::Processing, Some(-3.0)).expect("status");
        assert_eq!(store.get(&job.id, false).map(|j| j.progress), Some(0.0));
    }

    #[test]
    fn test_logs_append_replace_and_cap() {
        let store = JsonJobStore::in_memory(50, 3);
        let job = store.create(make_job("u")).expect("create");

        store.append_log(&job.id, "a").expect("append");
        store.append_log(&job.id, "b").expect("append");
        store.replace_last_log(&job.id, "b2").expect("replace");
        store.append_log(&job.id, "c").expect("append");

        let stored = store.get(&job.id, true).expect("job exists");
        assert_eq!(stored.logs, vec!["a", "b2", "c"]);
        assert!(store.get(&job.id, false).expect("job exists").logs.is_empty());
    }

    #[test]
    fn test_item_cap_keeps_active_jobs() {
        let store = JsonJobStore::in_memory(2, 500);
        let first = store.create(make_job("1")).expect("create");
        store.mark_success(&first.id).expect("success");
        let second = store.create(make_job("2")).expect("create");
        let third = store.create(make_job("3")).expect("create");

        assert!(store.get(&first.id, false).is_none());
        assert!(store.get(&second.id, false).is_some());
        assert!(store.get(&third.id, false).is_some());
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let store = JsonJobStore::in_memory(50, 500);
        let err = store.append_log("missing", "x").expect_err("must fail");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_open_persists_and_recovers_interrupted_jobs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state/jobs.json");

        let (running_id, done_id) = {
            let store = JsonJobStore::open(&path, 50, 500).expect("open");
            let running = store.create(make_job("1")).expect("create");
            store
                .set_status(&running.id, JobStatus::Processing, Some(20.0))
                .expect("status");
            let done = store.create(make_job("2")).expect("create");
            store.mark_success(&done.id).expect("success");
            (running.id, done.id)
        };
        assert!(path.exists());

        let reopened = JsonJobStore::open(&path, 50, 500).expect("reopen");
        let running = reopened.get(&running_id, true).expect("job persisted");
        assert_eq!(running.status, JobStatus::Failed);
        assert_eq!(running.message, INTERRUPTED_MESSAGE);
        assert_eq!(
            reopened.get(&done_id, false).map(|j| j.status),
            Some(JobStatus::Success)
        );
    }

    #[test]
    fn test_log_lines_are_coalesced_until_flush() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("jobs.json");
        let store = JsonJobStore::open(&path, 50, 500).expect("open");
        let job = store.create(make_job("1")).expect("create");

        store.append_log(&job.id, "one").expect("append");
        store
            .set_status(&job.id, JobStatus::Queued, Some(5.0))
            .expect("progress");
        let saved = load_jobs(&path).expect("load");
        assert_eq!(saved[0].logs, vec!["Job queued.".to_string()]);
        assert_eq!(saved[0].progress, 0.0);

        store.flush().expect("flush");
        let saved = load_jobs(&path).expect("load");
        assert_eq!(saved[0].logs.last().map(String::as_str), Some("one"));
        assert_eq!(saved[0].progress, 5.0);
        assert!(store.flush().is_ok());
    }

    #[test]
    fn test_terminal_writes_are_saved_immediately() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("jobs.json");
        let store = JsonJobStore::open(&path, 50, 500).expect("open");
        let job = store.create(make_job("1")).expect("create");

        store.append_log(&job.id, "Success!").expect("append");
        store.mark_success(&job.id).expect("success");

        let saved = load_jobs(&path).expect("load");
        assert_eq!(saved[0].status, JobStatus::Success);
        assert_eq!(saved[0].logs.last().map(String::as_str), Some("Success!"));
    }

    #[test]
    fn test_load_jobs_missing_or_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("jobs.json");
        assert!(load_jobs(&path).expect("missing file").is_empty());

        fs::write(&path, "{not json").unwrap();
        assert!(load_jobs(&path).expect("corrupt file").is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Once terminal, no sequence of writes changes a job's status
        #[test]
        fn prop_terminal_status_absorbing(
            terminal in prop_oneof![
                Just(JobStatus::Success),
                Just(JobStatus::Failed),
                Just(JobStatus::Cancelled),
            ],
            writes in prop::collection::vec(status_strategy(), 0..10),
        ) {
            let store = JsonJobStore::in_memory(50, 500);
            let job = store.create(make_job("u")).unwrap();
            match terminal {
                JobStatus::Success => store.mark_success(&job.id).unwrap(),
                JobStatus::Failed => store.mark_failure(&job.id, "x").unwrap(),
                _ => store.mark_cancelled(&job.id, "x").unwrap(),
            }

            for status in writes {
                match status {
                    JobStatus::Success => store.mark_success(&job.id).unwrap(),
                    JobStatus::Failed => store.mark_failure(&job.id, "y").unwrap(),
                    JobStatus::Cancelled => store.mark_cancelled(&job.id, "y").unwrap(),
                    other => store.set_status(&job.id, other, Some(5.0)).unwrap(),
                }
            }

            prop_assert_eq!(store.get(&job.id, false).unwrap().status, terminal);
        }

        /// The log list never exceeds its cap and keeps the newest lines
        #[test]
        fn prop_log_cap(cap in 1usize..20, lines in prop::collection::vec("[a-z]{1,5}", 0..60)) {
            let store = JsonJobStore::in_memory(50, cap);
            let job = store.create(make_job("u")).unwrap();
            for line in &lines {
                store.append_log(&job.id, line).unwrap();
            }
            let logs = store.get(&job.id, true).unwrap().logs;
            prop_assert!(logs.len() <= cap);
            if let Some(last) = lines.last() {
                prop_assert_eq!(logs.last(), Some(last));
            }
        }
    }
}
