//! Fetch daemon
//!
//! Background service that runs yt-dlp download jobs into a Radarr movie
//! library: job store, cancellable workers, process supervision and the HTTP API.

pub mod cache;
pub mod catalog;
pub mod daemon;
pub mod fetch;
pub mod job_executor;
pub mod jobs;
pub mod naming;
pub mod paths;
pub mod phase;
pub mod process;
pub mod registry;
pub mod server;
pub mod startup;

#[cfg(test)]
mod test_support;

pub use fetch_daemon_config as config;
pub use fetch_daemon_config::Config;
pub use catalog::{Catalog, CatalogError, Movie, RadarrClient};
pub use daemon::{CancelError, CancelOutcome, Daemon, DaemonError, SubmitError};
pub use job_executor::JobExecutor;
pub use jobs::{Job, JobRequest, JobStatus, JobStore, JsonJobStore, StoreError};
pub use registry::JobRegistry;
pub use server::{create_router, run_server, ServerError};
pub use startup::{run_startup_checks, StartupError, StartupReport};
