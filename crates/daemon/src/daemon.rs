//! Daemon startup and job control for the fetch daemon
//!
//! Provides the daemon entry point, job submission with request validation,
//! cancellation and job listing, plus the HTTP server loop.

use crate::catalog::{Catalog, CatalogError, RadarrClient};
use crate::config::{Config, ConfigError};
use crate::job_executor::JobExecutor;
use crate::jobs::{Job, JobRequest, JobStore, JobUpdate, JsonJobStore, StoreError};
use crate::registry::JobRegistry;
use crate::server::{run_server, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use parking_lot::RwLock;
use regex::Regex;
use reqwest::Url;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{info, warn};

/// Log line appended to a job on its first cancellation request
pub const CANCEL_REQUESTED_LOG: &str = "Cancellation requested by user.";

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Job store could not be opened
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    /// Catalog client could not be built
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Rejected job submission
#[derive(Debug, Error)]
pub enum SubmitError {
    /// One message per invalid field, in field order
    #[error("{}", .0.join(" "))]
    Invalid(Vec<String>),

    #[error("Failed to record job: {0}")]
    Store(#[from] StoreError),
}

/// Rejected cancellation request
#[derive(Debug, Error)]
pub enum CancelError {
    #[error("Job not found.")]
    NotFound,

    #[error("Job is not active and cannot be cancelled.")]
    NotActive(Box<Job>),

    #[error("Job worker is no longer active.")]
    WorkerGone(Box<Job>),
}

/// Accepted cancellation request
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub job: Job,
    pub already_requested: bool,
    pub message: &'static str,
}

fn scheme_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://").expect("static regex"))
}

/// Validate a submitted video URL, adding `https://` when no scheme is given
pub fn normalize_url(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("Video URL is required.".to_string());
    }
    let with_scheme = if scheme_re().is_match(raw) {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    let parsed =
        Url::parse(&with_scheme).map_err(|_| "Please provide a valid video URL.".to_string())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err("Only http and https video URLs are supported.".to_string());
    }
    Ok(parsed.to_string())
}

/// Check a submitted request and return its cleaned-up form.
///
/// Every problem is reported, not only the first one.
pub fn validate_request(mut request: JobRequest) -> Result<JobRequest, SubmitError> {
    let mut errors = Vec::new();

    match normalize_url(&request.url) {
        Ok(url) => request.url = url,
        Err(message) => errors.push(message),
    }

    let mode = request.playlist_mode.trim().to_lowercase();
    request.playlist_mode = match mode.as_str() {
        "" | "single" => "single".to_string(),
        "merge" => "merge".to_string(),
        _ => {
            errors.push("Invalid playlist handling option selected.".to_string());
            "single".to_string()
        }
    };

    request.extra_name = request.extra_name.trim().to_string();
    if request.standalone {
        request.extra = false;
        request.extra_name.clear();
        request.extra_type = "other".to_string();
    } else if request.extra && request.extra_name.is_empty() {
        errors.push("Extra name is required when storing in a subfolder.".to_string());
    }

    request.movie_id = request.movie_id.trim().to_string();
    let has_target = !request.movie_id.is_empty()
        || !request.tmdb.trim().is_empty()
        || !request.title.trim().is_empty();
    if !request.standalone && !has_target {
        errors.push(
            "No movie selected. Please choose a movie from the suggestions list.".to_string(),
        );
    }

    if errors.is_empty() {
        Ok(request)
    } else {
        Err(SubmitError::Invalid(errors))
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    config: Arc<RwLock<Config>>,
    /// Job history
    store: Arc<dyn JobStore>,
    /// Runtime controls of live jobs
    registry: Arc<JobRegistry>,
    /// Job executor driving the download pipeline
    executor: Arc<JobExecutor>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file and apply environment overrides
    /// 2. Run startup checks (yt-dlp required, ffmpeg optional)
    /// 3. Open the job store, failing interrupted jobs
    /// 4. Build the catalog client
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        run_startup_checks(&config)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    ///
    /// Startup checks are skipped.
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        let store = JsonJobStore::open(
            &config.state_file(),
            config.jobs.max_items,
            config.jobs.max_logs,
        )?;
        let catalog = RadarrClient::new(&config.catalog)?;
        Ok(Self::with_parts(config, Arc::new(store), Arc::new(catalog)))
    }

    /// Assemble a daemon from ready-made parts
    pub fn with_parts(config: Config, store: Arc<dyn JobStore>, catalog: Arc<dyn Catalog>) -> Self {
        let config = Arc::new(RwLock::new(config));
        let registry = Arc::new(JobRegistry::new());
        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&registry),
            catalog,
        ));
        Self {
            config,
            store,
            registry,
            executor,
        }
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Validate and enqueue a job, returning it as stored
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, request: JobRequest) -> Result<Job, SubmitError> {
        let request = validate_request(request)?;

        let job = self.store.create(Job::new(request.clone()))?;
        info!(job_id = %job.id, url = %request.url, "job submitted");
        // The worker reports through the store; its handle is not needed
        drop(self.executor.launch(&job.id, request));
        Ok(job)
    }

    /// Request cancellation of a queued or processing job
    ///
    /// The first request signals the job's running child process, if any,
    /// and records the request in the job log.
    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome, CancelError> {
        let job = self.store.get(job_id, true).ok_or(CancelError::NotFound)?;
        if !job.status.is_active() {
            return Err(CancelError::NotActive(Box::new(job)));
        }

        let request = self
            .registry
            .request_cancel(job_id)
            .ok_or_else(|| CancelError::WorkerGone(Box::new(job.clone())))?;

        if let Some(process) = request.process {
            process.signal_terminate();
        }

        let message = if request.already_requested {
            "Cancellation already requested."
        } else {
            info!(job_id = %job_id, "cancellation requested");
            if let Err(e) = self.store.append_log(job_id, CANCEL_REQUESTED_LOG) {
                warn!(job_id = %job_id, error = %e, "failed to record cancellation request");
            }
            if self.store.get(job_id, false).is_some_and(|j| !j.is_terminal()) {
                let update = JobUpdate {
                    message: Some("Cancelling...".to_string()),
                    ..JobUpdate::default()
                };
                if let Err(e) = self.store.update(job_id, update) {
                    warn!(job_id = %job_id, error = %e, "failed to update job message");
                }
            }
            "Cancellation requested."
        };

        Ok(CancelOutcome {
            job: self.store.get(job_id, true).unwrap_or(job),
            already_requested: request.already_requested,
            message,
        })
    }

    /// All jobs, newest first, without logs
    pub fn jobs(&self) -> Vec<Job> {
        self.store.list()
    }

    /// One job with its logs
    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.store.get(job_id, true)
    }

    /// Serve the HTTP API until the server stops
    pub async fn run_with_server(self: Arc<Self>) -> Result<(), DaemonError> {
        let bind = self.config.read().server.bind.clone();
        info!(bind = %bind, "starting HTTP API");
        let store = Arc::clone(&self.store);
        let served = run_server(self, &bind).await;
        if let Err(e) = store.flush() {
            warn!(error = %e, "failed to save job state on shutdown");
        }
        Ok(served?)
    }
}
