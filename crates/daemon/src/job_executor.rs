//! Job executor for the fetch daemon
//!
//! Runs each download job on its own task through the pipeline
//! probe → download → (merge) → rename, with optional admission control via
//! a semaphore. Every exit path ends in exactly one terminal job status and
//! removes the job's runtime control from the registry.

use crate::catalog::{resolve_movie, Catalog};
use crate::fetch::download::{download_command, is_intermediate, remove_files, remove_quietly};
use crate::fetch::merge::{staging_dir, SEGMENT_TEMPLATE};
use crate::fetch::probe::probe_command;
use crate::fetch::{fetch_metadata, merge_segments, run_download, OutputPattern, ProbeInfo};
use crate::jobs::{JobRequest, JobStatus, JobStore, JobUpdate, RequestNotice};
use crate::naming::{build_movie_stem, describe_job, extra_label, sanitize_filename, ExtraType};
use crate::paths::{
    resolve_library_path, select_standalone_root, standalone_folder, unique_filename, unique_stem,
};
use crate::phase::{Abort, JobLog, PhaseContext, PhaseResult};
use crate::process::Supervisor;
use crate::registry::JobRegistry;
use fetch_daemon_config::Config;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Final log line of a cancelled job
pub const JOB_CANCELLED_LOG: &str = "Job cancelled.";

/// Message stored on a cancelled job
pub const JOB_CANCELLED_MESSAGE: &str = "Job cancelled by user.";

/// Metadata prefixes replaced once the final file is known
const FORMAT_METADATA_PREFIXES: [&str; 6] = [
    "format:",
    "format id:",
    "resolution:",
    "video codec:",
    "audio codec:",
    "filesize:",
];

/// Files a job has produced so far, removed again when it aborts
#[derive(Debug, Default)]
struct Artifacts {
    pattern: Option<OutputPattern>,
    downloaded: Vec<PathBuf>,
    staging: Option<PathBuf>,
}

impl Artifacts {
    fn remove_staging(&self) {
        if let Some(dir) = self.staging.as_ref().filter(|d| d.is_dir()) {
            if let Err(e) = fs::remove_dir_all(dir) {
                debug!(path = %dir.display(), error = %e, "failed to remove staging directory");
            }
        }
    }

    /// After a fatal error: drop fragments and staged segments, keep
    /// completed downloads in the library folder.
    fn cleanup_failed(&self) {
        if let Some(pattern) = &self.pattern {
            pattern.purge_fragments();
        }
        self.remove_staging();
    }

    /// After cancellation: nothing the job produced is kept.
    fn discard(&self) {
        if let Some(pattern) = &self.pattern {
            pattern.purge_fragments();
        }
        remove_files(&self.downloaded);
        self.remove_staging();
    }
}

/// Where the finished file goes
enum Target {
    Standalone { root: PathBuf },
    Library { dir: PathBuf, canonical_stem: String },
}

/// Job executor that drives download jobs with optional admission control
///
/// The semaphore is only present when `jobs.max_concurrent_jobs` is non-zero;
/// otherwise every submitted job starts immediately.
pub struct JobExecutor {
    config: Arc<RwLock<Config>>,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    catalog: Arc<dyn Catalog>,
    semaphore: Option<Arc<Semaphore>>,
}

impl JobExecutor {
    /// Create a new JobExecutor
    ///
    /// # Arguments
    /// * `config` - Shared configuration, snapshotted when each job starts
    /// * `store` - Job store receiving status, progress and log updates
    /// * `registry` - Runtime controls of live jobs
    /// * `catalog` - Movie catalog for library downloads
    pub fn new(
        config: Arc<RwLock<Config>>,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        let limit = config.read().jobs.max_concurrent_jobs as usize;
        let semaphore = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
        Self {
            config,
            store,
            registry,
            catalog,
            semaphore,
        }
    }

    /// Number of free execution slots, `None` when unbounded
    pub fn available_permits(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// Register the job and start its worker task.
    ///
    /// The control is registered before the task is spawned so the job can
    /// be cancelled as soon as this returns. The handle resolves to the
    /// job's terminal status.
    pub fn launch(self: &Arc<Self>, job_id: &str, request: JobRequest) -> JoinHandle<JobStatus> {
        let cancel = self.registry.register(job_id);
        let executor = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move { executor.supervise(job_id, request, cancel).await })
    }

    /// Run the job on an inner task so a panic still ends in a terminal
    /// status, then release the job's runtime control.
    async fn supervise(
        self: Arc<Self>,
        job_id: String,
        request: JobRequest,
        cancel: CancellationToken,
    ) -> JobStatus {
        let inner = {
            let executor = Arc::clone(&self);
            let job_id = job_id.clone();
            tokio::spawn(async move { executor.execute(&job_id, request, cancel).await })
        };

        let status = match inner.await {
            Ok(status) => status,
            Err(join_err) => {
                let message = format!("Unexpected error: {}", join_err);
                error!(job_id = %job_id, "{}", message);
                let log = JobLog::new(Arc::clone(&self.store), &job_id);
                log.error(&message);
                if let Err(e) = self.store.mark_failure(&job_id, &message) {
                    error!(job_id = %job_id, error = %e, "failed to record job failure");
                }
                JobStatus::Failed
            }
        };

        self.registry.clear_process(&job_id);
        self.registry.unregister(&job_id);
        info!(job_id = %job_id, status = %status, "job finished");
        status
    }

    /// Wait for an execution slot, giving up if the job is cancelled first
    async fn acquire_permit(&self, ctx: &PhaseContext) -> PhaseResult<Option<OwnedSemaphorePermit>> {
        let Some(semaphore) = &self.semaphore else {
            return Ok(None);
        };
        match ctx.or_cancel(Arc::clone(semaphore).acquire_owned()).await? {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => Err(Abort::failed("Job executor is shutting down.")),
        }
    }

    /// Execute a job and record its terminal status.
    async fn execute(&self, job_id: &str, request: JobRequest, cancel: CancellationToken) -> JobStatus {
        let config = self.config.read().clone();
        let log = JobLog::new(Arc::clone(&self.store), job_id);
        let supervisor = Supervisor::for_job(Arc::clone(&self.registry), job_id, cancel);
        let ctx = PhaseContext::new(log, supervisor, config.fetch.debug_mode);
        let mut artifacts = Artifacts::default();

        let result = match self.acquire_permit(&ctx).await {
            Ok(_permit) => self.pipeline(&ctx, &config, request, &mut artifacts).await,
            Err(abort) => Err(abort),
        };

        match result {
            Ok(path) => {
                ctx.log.progress(100.0);
                ctx.log
                    .info(&format!("Success! Video saved as '{}'.", path.display()));
                if let Err(e) = self.store.mark_success(job_id) {
                    error!(job_id = %job_id, error = %e, "failed to record job success");
                }
                JobStatus::Success
            }
            Err(Abort::Cancelled) => {
                artifacts.discard();
                ctx.log.info(JOB_CANCELLED_LOG);
                if let Err(e) = self.store.mark_cancelled(job_id, JOB_CANCELLED_MESSAGE) {
                    error!(job_id = %job_id, error = %e, "failed to record job cancellation");
                }
                JobStatus::Cancelled
            }
            Err(Abort::Failed(message)) => {
                artifacts.cleanup_failed();
                ctx.log.error(&message);
                if let Err(e) = self.store.mark_failure(job_id, &message) {
                    error!(job_id = %job_id, error = %e, "failed to record job failure");
                }
                JobStatus::Failed
            }
        }
    }

    /// The download pipeline, returning the final file path.
    async fn pipeline(
        &self,
        ctx: &PhaseContext,
        config: &Config,
        mut request: JobRequest,
        artifacts: &mut Artifacts,
    ) -> PhaseResult<PathBuf> {
        ctx.log.progress(1.0);
        if !config.is_configured() {
            return Err(Abort::failed("Application has not been configured yet."));
        }
        ctx.checkpoint()?;

        for notice in request.normalize() {
            match notice {
                RequestNotice::Warning(message) => ctx.log.warn(&message),
                RequestNotice::Info(message) => ctx.log.info(&message),
            }
        }
        let descriptor = describe_job(&request);
        ctx.log.update(JobUpdate {
            label: Some(descriptor.label),
            subtitle: Some(descriptor.subtitle),
            metadata: Some(descriptor.metadata),
            request: Some(request.clone()),
            ..JobUpdate::default()
        });
        ctx.checkpoint()?;

        let target = self.resolve_target(ctx, config, &mut request).await?;
        let merge = request.merge_playlist();
        if merge {
            ctx.log
                .info("Playlist download requested; videos will be merged into a single file.");
        }

        let mut descriptive = if request.extra {
            request.extra_name.clone()
        } else {
            String::new()
        };
        if let Some(custom) = request.custom_standalone_name() {
            descriptive = custom.to_string();
        }
        if !descriptive.is_empty() {
            ctx.log
                .info(&format!("Using custom descriptive name '{}'.", descriptive));
        }

        if which::which(&config.fetch.ffmpeg_path).is_err() {
            ctx.log.warn(
                "ffmpeg executable not found; yt-dlp may fall back to a lower quality progressive stream.",
            );
        }

        let cookie = config.cookie_path();
        let probe_spec = probe_command(
            &config.fetch.ytdlp_path,
            cookie.as_deref(),
            &config.fetch.format_selector,
            merge,
            &request.url,
        );
        let info = fetch_metadata(
            ctx,
            &probe_spec,
            Duration::from_secs(config.fetch.metadata_timeout_secs),
        )
        .await?;
        match &info {
            Some(info) => ctx.log.info(&info.summary.log_line()),
            None => ctx
                .log
                .info("yt-dlp did not report a resolved format; proceeding with download."),
        }

        let default_label = if merge { "Playlist" } else { "Video" };
        if descriptive.is_empty() {
            match info.as_ref().and_then(|i| i.display_title(merge)) {
                Some(title) => {
                    descriptive = title.to_string();
                    ctx.log.info(&format!("Using YouTube title '{}'.", descriptive));
                }
                None => {
                    descriptive = default_label.to_string();
                    let subject = if merge { "playlist" } else { "video" };
                    ctx.log.warn(&format!(
                        "yt-dlp did not provide a {} title. Using fallback name '{}'.",
                        subject, default_label
                    ));
                }
            }
        }
        let descriptive = non_empty_or(sanitize_filename(&descriptive), default_label);

        let mut filename_base = if request.extra {
            let suffix = non_empty_or(sanitize_filename(&request.extra_name), &request.extra_type);
            format!("{}-{}", descriptive, suffix)
        } else {
            descriptive
        };
        filename_base = non_empty_or(filename_base, "Video");

        let (download_dir, canonical_stem) = match target {
            Target::Library {
                dir,
                canonical_stem,
            } => (dir, canonical_stem),
            Target::Standalone { root } => {
                let mut folder_name = filename_base.clone();
                if request.custom_standalone_name().is_none() {
                    if let Some(title) = info.as_ref().and_then(|i| i.display_title(merge)) {
                        folder_name = title.to_string();
                    }
                }
                let folder_name = non_empty_or(
                    sanitize_filename(&folder_name),
                    &non_empty_or(filename_base.clone(), "Video"),
                );

                let folder = standalone_folder(&root, &folder_name).map_err(|e| {
                    Abort::failed(format!("Could not prepare standalone folder: {}", e))
                })?;
                if folder.created {
                    ctx.log.info(&format!(
                        "Created standalone folder at '{}'.",
                        folder.path.display()
                    ));
                } else {
                    ctx.log.info(&format!(
                        "Standalone folder resolved to '{}'.",
                        folder.path.display()
                    ));
                }
                filename_base = folder.name.clone();
                (folder.path, folder.name)
            }
        };

        let download_stem = unique_stem(&download_dir, &filename_base);
        if download_stem != filename_base {
            ctx.log.info(&format!(
                "File stem '{}' already exists. Searching for a free filename.",
                filename_base
            ));
            ctx.log
                .info(&format!("Selected new filename stem '{}'.", download_stem));
        }

        let (template, pattern) = if merge {
            let staging = staging_dir(&download_dir, ctx.log.job_id());
            fs::create_dir_all(&staging).map_err(|e| {
                Abort::failed(format!("Failed to create playlist staging directory: {}", e))
            })?;
            ctx.log.info(&format!(
                "Playlist merge enabled. Downloads will be staged in '{}'.",
                staging
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ));
            artifacts.staging = Some(staging.clone());
            (staging.join(SEGMENT_TEMPLATE), OutputPattern::any_in(&staging))
        } else {
            let template_base = download_stem.replace('%', "%%");
            (
                download_dir.join(format!("{}.%(ext)s", template_base)),
                OutputPattern::for_stem(&download_dir, &download_stem),
            )
        };
        artifacts.pattern = Some(pattern.clone());

        let spec = download_command(
            &config.fetch.ytdlp_path,
            cookie.as_deref(),
            &config.fetch.format_selector,
            merge,
            &template,
            &request.url,
            &download_dir,
        );
        ctx.log.info("Running yt-dlp with explicit output template.");
        ctx.log.progress(20.0);

        artifacts.downloaded = run_download(ctx, &spec, &pattern).await?;

        if merge {
            let staging = artifacts
                .staging
                .clone()
                .ok_or_else(|| Abort::failed("Playlist staging directory was not created."))?;
            let segments = artifacts.downloaded.clone();
            let merged = merge_segments(ctx, &config.fetch.ffmpeg_path, &staging, segments).await?;
            artifacts.downloaded = vec![merged];
        }

        self.finalize(ctx, info.as_ref(), &download_dir, &canonical_stem, artifacts)
    }

    /// Pick the target folder, resolving the catalog movie when needed.
    async fn resolve_target(
        &self,
        ctx: &PhaseContext,
        config: &Config,
        request: &mut JobRequest,
    ) -> PhaseResult<Target> {
        if request.standalone {
            let root = select_standalone_root(&config.library.roots).ok_or_else(|| {
                Abort::failed("Standalone downloads require at least one accessible library path.")
            })?;
            ctx.log
                .info("Standalone download requested; skipping Radarr library lookup.");
            ctx.log.info(&format!(
                "Standalone base path resolved to '{}'.",
                root.display()
            ));
            ctx.log.progress(10.0);
            return Ok(Target::Standalone { root });
        }

        let lookup = ctx
            .or_cancel(resolve_movie(
                self.catalog.as_ref(),
                &request.movie_id,
                &request.tmdb,
                &request.title,
                &request.year,
            ))
            .await?
            .map_err(|e| Abort::failed(format!("Could not look up movie in Radarr: {}", e)))?
            .ok_or_else(|| {
                Abort::failed("No movie selected. Please choose a movie from the suggestions list.")
            })?;
        if let Some(note) = &lookup.note {
            ctx.log.info(note);
        }
        request.movie_id = lookup.id.to_string();
        ctx.log.update(JobUpdate {
            request: Some(request.clone()),
            ..JobUpdate::default()
        });

        ctx.log.info(&format!(
            "Fetching Radarr details for movie ID {}.",
            lookup.id
        ));
        let movie = ctx
            .or_cancel(self.catalog.movie(lookup.id))
            .await?
            .map_err(|e| {
                Abort::failed(format!(
                    "Could not retrieve movie info from Radarr (ID {}): {}",
                    lookup.id, e
                ))
            })?;

        let movie_path = movie.path.clone().unwrap_or_default();
        let resolved = resolve_library_path(
            &movie_path,
            &config.library.roots,
            &config.library.path_overrides,
            true,
        )
        .ok_or_else(|| Abort::failed(format!("Movie folder not found on disk: {}", movie_path)))?;
        if resolved.created {
            ctx.log.info(&format!(
                "Created movie folder at '{}'.",
                resolved.path.display()
            ));
        }
        ctx.log.info(&format!(
            "Movie path resolved to '{}'.",
            resolved.path.display()
        ));
        ctx.log.progress(10.0);
        ctx.checkpoint()?;

        let mut dir = resolved.path;
        if request.extra {
            let subfolder = ExtraType::from_key(&request.extra_type)
                .unwrap_or(ExtraType::Other)
                .folder();
            dir = dir.join(subfolder);
            fs::create_dir_all(&dir).map_err(|e| {
                Abort::failed(format!(
                    "Failed to create extras folder '{}': {}",
                    dir.display(),
                    e
                ))
            })?;
            ctx.log
                .info(&format!("Storing video in subfolder '{}'.", subfolder));
        } else {
            ctx.log.info("Treating video as main video file.");
        }

        let movie_stem = build_movie_stem(&movie);
        ctx.log
            .info(&format!("Resolved Radarr movie stem to '{}'.", movie_stem));

        let canonical_stem = if request.extra {
            let label = extra_label(&request.extra_name, &request.extra_type);
            ctx.log.info(&format!("Using extra label '{}'.", label));
            format!("{} {}", movie_stem, label)
        } else {
            movie_stem
        };

        Ok(Target::Library {
            dir,
            canonical_stem,
        })
    }

    /// Rename the downloaded file to its canonical name and tidy up.
    fn finalize(
        &self,
        ctx: &PhaseContext,
        info: Option<&ProbeInfo>,
        dir: &Path,
        canonical_stem: &str,
        artifacts: &mut Artifacts,
    ) -> PhaseResult<PathBuf> {
        let finals: Vec<&PathBuf> = artifacts
            .downloaded
            .iter()
            .filter(|p| !is_intermediate(p))
            .collect();
        let pool: Vec<&PathBuf> = if finals.is_empty() {
            artifacts.downloaded.iter().collect()
        } else {
            finals
        };
        let source = pool
            .into_iter()
            .max_by_key(|p| modified_time(p))
            .cloned()
            .ok_or_else(|| {
                Abort::failed("Download completed but the output file could not be located.")
            })?;

        let extension = source
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        self.record_format_metadata(ctx, info, &extension);

        let wanted = if extension.is_empty() {
            canonical_stem.to_string()
        } else {
            format!("{}.{}", canonical_stem, extension)
        };
        // The download itself may already sit at the canonical path
        let (file_name, collided) = if dir.join(&wanted) == source {
            (wanted.clone(), false)
        } else {
            unique_filename(dir, canonical_stem, &extension, &artifacts.downloaded)
        };
        if collided {
            ctx.log.info(&format!(
                "Canonical name '{}' is already taken. Searching for a free name.",
                wanted
            ));
            ctx.log
                .info(&format!("Selected canonical filename '{}'.", file_name));
        }
        let destination = dir.join(&file_name);

        if source != destination {
            ctx.log.info(&format!(
                "Renaming downloaded file to canonical name '{}'.",
                file_name
            ));
            fs::rename(&source, &destination).map_err(|e| {
                Abort::failed(format!(
                    "Failed to rename downloaded file to '{}': {}",
                    file_name, e
                ))
            })?;
            for entry in artifacts.downloaded.iter_mut().filter(|p| **p == source) {
                *entry = destination.clone();
            }
        } else {
            ctx.log.info("Download already matches canonical filename.");
        }

        ctx.checkpoint()?;

        for leftover in artifacts
            .downloaded
            .iter()
            .filter(|p| **p != destination && is_intermediate(p))
        {
            remove_quietly(leftover);
        }
        artifacts.remove_staging();

        Ok(destination)
    }

    /// Replace format details in the job metadata with the final values
    fn record_format_metadata(&self, ctx: &PhaseContext, info: Option<&ProbeInfo>, extension: &str) {
        let Some(job) = self.store.get(ctx.log.job_id(), false) else {
            return;
        };
        let mut metadata: Vec<String> = job
            .metadata
            .into_iter()
            .filter(|entry| {
                let lowered = entry.to_lowercase();
                !FORMAT_METADATA_PREFIXES.iter().any(|p| lowered.starts_with(p))
            })
            .collect();
        if !extension.is_empty() {
            metadata.push(format!("Format: {}", extension.to_uppercase()));
        }
        if let Some(info) = info {
            metadata.extend(info.summary.metadata_entries());
        }
        ctx.log.update(JobUpdate {
            metadata: Some(metadata),
            ..JobUpdate::default()
        });
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn modified_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::catalog::tests::StaticCatalog;
    use crate::catalog::Movie;
    use crate::jobs::{Job, JsonJobStore};
    use crate::phase::CANCEL_ACKNOWLEDGED;
    use crate::test_support::*;
    use tempfile::TempDir;

    struct Harness {
        temp: TempDir,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        executor: Arc<JobExecutor>,
    }

    impl Harness {
        fn new(download: &str, movies: Vec<Movie>, tweak: impl FnOnce(&mut Config)) -> Self {
            let temp = TempDir::new().unwrap();
            let library = temp.path().join("library");
            fs::create_dir(&library).unwrap();
            let ytdlp = fake_ytdlp(temp.path(), PROBE_CLIP, download);
            let mut config = test_config(&library, &ytdlp);
            tweak(&mut config);

            let store: Arc<dyn JobStore> = Arc::new(JsonJobStore::in_memory(50, 500));
            let registry = Arc::new(JobRegistry::new());
            let executor = Arc::new(JobExecutor::new(
                Arc::new(RwLock::new(config)),
                Arc::clone(&store),
                Arc::clone(&registry),
                Arc::new(StaticCatalog { movies }),
            ));
            Self {
                temp,
                store,
                registry,
                executor,
            }
        }

        fn library(&self) -> PathBuf {
            self.temp.path().join("library")
        }

        fn submit(&self, request: JobRequest) -> (String, JoinHandle<JobStatus>) {
            let job = self.store.create(Job::new(request.clone())).unwrap();
            let handle = self.executor.launch(&job.id, request);
            (job.id, handle)
        }

        fn logs(&self, id: &str) -> Vec<String> {
            self.store.get(id, true).unwrap().logs
        }
    }

    fn standalone(url: &str) -> JobRequest {
        JobRequest {
            url: url.to_string(),
            standalone: true,
            ..JobRequest::default()
        }
    }

    fn alpha_movie(path: &Path) -> Movie {
        Movie {
            id: 1,
            title: "Alpha".to_string(),
            year: Some(2020),
            tmdb_id: Some(1),
            path: Some(path.to_string_lossy().into_owned()),
        }
    }

    fn for_movie(id: &str) -> JobRequest {
        JobRequest {
            url: "https://youtu.be/alpha".to_string(),
            movie_id: id.to_string(),
            ..JobRequest::default()
        }
    }

    #[tokio::test]
    async fn test_standalone_download_succeeds() {
        let h = Harness::new(DOWNLOAD_SINGLE, vec![], |_| {});
        let (id, handle) = h.submit(standalone("https://youtu.be/clip"));

        assert_eq!(handle.await.unwrap(), JobStatus::Success);

        let saved = h.library().join("Alpha Clip").join("Alpha Clip.mp4");
        assert!(saved.is_file());
        let job = h.store.get(&id, true).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.progress, 100.0);
        assert!(job.metadata.contains(&"Format: MP4".to_string()));
        assert!(job.metadata.contains(&"Resolution: 1280x720".to_string()));
        assert!(job
            .logs
            .iter()
            .any(|l| l.starts_with("Success! Video saved as")));
        // Compact progress: three bars collapse into one entry
        assert_eq!(job.logs.iter().filter(|l| l.starts_with("[download]")).count(), 1);
        assert!(!h.registry.contains(&id));
    }

    #[tokio::test]
    async fn test_debug_mode_keeps_every_progress_line() {
        let h = Harness::new(DOWNLOAD_SINGLE, vec![], |c| c.fetch.debug_mode = true);
        let (id, handle) = h.submit(standalone("https://youtu.be/clip"));

        assert_eq!(handle.await.unwrap(), JobStatus::Success);
        let bars = h.logs(&id).into_iter().filter(|l| l.starts_with("[download]")).count();
        assert_eq!(bars, 3);
    }

    #[tokio::test]
    async fn test_library_download_avoids_collisions() {
        let temp_movie = TempDir::new().unwrap();
        let movie_dir = temp_movie.path().join("Alpha (2020)");
        fs::create_dir(&movie_dir).unwrap();
        fs::write(movie_dir.join("Alpha (2020) {tmdb-1}.mp4"), "old").unwrap();

        let h = Harness::new(DOWNLOAD_SINGLE, vec![alpha_movie(&movie_dir)], |_| {});

        let (_, first) = h.submit(for_movie("1"));
        assert_eq!(first.await.unwrap(), JobStatus::Success);
        assert!(movie_dir.join("Alpha (2020) {tmdb-1} (1).mp4").is_file());

        let (_, second) = h.submit(for_movie("1"));
        assert_eq!(second.await.unwrap(), JobStatus::Success);
        assert!(movie_dir.join("Alpha (2020) {tmdb-1} (2).mp4").is_file());
        assert_eq!(fs::read_to_string(movie_dir.join("Alpha (2020) {tmdb-1}.mp4")).unwrap(), "old");
    }

    #[tokio::test]
    async fn test_existing_copy_in_another_container_counts_as_collision() {
        let temp_movie = TempDir::new().unwrap();
        let movie_dir = temp_movie.path().join("Alpha (2020)");
        fs::create_dir(&movie_dir).unwrap();
        fs::write(movie_dir.join("Alpha (2020) {tmdb-1}.mkv"), "old").unwrap();

        let h = Harness::new(DOWNLOAD_SINGLE, vec![alpha_movie(&movie_dir)], |_| {});
        let (id, handle) = h.submit(for_movie("1"));

        assert_eq!(handle.await.unwrap(), JobStatus::Success);
        assert!(movie_dir.join("Alpha (2020) {tmdb-1} (1).mp4").is_file());
        assert!(!movie_dir.join("Alpha (2020) {tmdb-1}.mp4").exists());
        assert!(h
            .logs(&id)
            .iter()
            .any(|l| l.contains("Searching for a free name")));
    }

    #[tokio::test]
    async fn test_extra_goes_into_type_subfolder() {
        let temp_movie = TempDir::new().unwrap();
        let movie_dir = temp_movie.path().join("Alpha (2020)");
        fs::create_dir(&movie_dir).unwrap();

        let h = Harness::new(DOWNLOAD_SINGLE, vec![alpha_movie(&movie_dir)], |_| {});
        let request = JobRequest {
            extra: true,
            extra_type: "trailer".to_string(),
            extra_name: "Teaser".to_string(),
            ..for_movie("1")
        };
        let (id, handle) = h.submit(request);

        assert_eq!(handle.await.unwrap(), JobStatus::Success);
        assert!(movie_dir
            .join("Trailers")
            .join("Alpha (2020) {tmdb-1} Teaser.mp4")
            .is_file());
        let job = h.store.get(&id, false).unwrap();
        assert_eq!(job.subtitle, "Extra • Teaser");
    }

    #[tokio::test]
    async fn test_playlist_merge_leaves_single_file() {
        let h = Harness::new(DOWNLOAD_PLAYLIST, vec![], |_| {});
        let ffmpeg = fake_ffmpeg(h.temp.path());
        h.executor.config.write().fetch.ffmpeg_path = ffmpeg.to_string_lossy().into_owned();

        let request = JobRequest {
            playlist_mode: "merge".to_string(),
            ..standalone("https://youtube.com/playlist?list=x")
        };
        let (_, handle) = h.submit(request);
        assert_eq!(handle.await.unwrap(), JobStatus::Success);

        let folder = h.library().join("Alpha Clip");
        let entries: Vec<String> = fs::read_dir(&folder)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["Alpha Clip.mp4".to_string()]);
        assert_eq!(fs::read_to_string(folder.join("Alpha Clip.mp4")).unwrap(), "merged");
    }

    #[tokio::test]
    async fn test_cancel_during_download() {
        let h = Harness::new(DOWNLOAD_HANG, vec![], |_| {});
        let (id, handle) = h.submit(standalone("https://youtu.be/clip"));

        let registry = Arc::clone(&h.registry);
        let store = Arc::clone(&h.store);
        let job_id = id.clone();
        wait_for(move || {
            registry.process(&job_id).is_some()
                && store
                    .get(&job_id, true)
                    .is_some_and(|j| j.logs.iter().any(|l| l.starts_with("[download]")))
        })
        .await;

        let request = h.registry.request_cancel(&id).expect("job is live");
        assert!(!request.already_requested);
        if let Some(process) = request.process {
            process.signal_terminate();
        }
        let again = h.registry.request_cancel(&id).expect("job is live");
        assert!(again.already_requested);

        assert_eq!(handle.await.unwrap(), JobStatus::Cancelled);

        let job = h.store.get(&id, true).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.message, JOB_CANCELLED_MESSAGE);
        assert_eq!(job.logs.iter().filter(|l| *l == CANCEL_ACKNOWLEDGED).count(), 1);
        assert_eq!(job.logs.last().map(String::as_str), Some(JOB_CANCELLED_LOG));

        let folder = h.library().join("Alpha Clip");
        let leftovers = fs::read_dir(&folder).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
        assert!(!h.registry.contains(&id));
    }

    #[tokio::test]
    async fn test_queued_job_cancelled_while_waiting_for_slot() {
        let h = Harness::new(DOWNLOAD_HANG, vec![], |c| c.jobs.max_concurrent_jobs = 1);
        let (first_id, first) = h.submit(standalone("https://youtu.be/one"));

        let registry = Arc::clone(&h.registry);
        let waiting_on = first_id.clone();
        wait_for(move || registry.process(&waiting_on).is_some()).await;

        assert_eq!(h.executor.available_permits(), Some(0));
        let (second_id, second) = h.submit(standalone("https://youtu.be/two"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            h.store.get(&second_id, false).map(|j| j.status),
            Some(JobStatus::Queued)
        );

        h.registry.request_cancel(&second_id);
        assert_eq!(second.await.unwrap(), JobStatus::Cancelled);

        if let Some(request) = h.registry.request_cancel(&first_id) {
            if let Some(process) = request.process {
                process.signal_terminate();
            }
        }
        assert_eq!(first.await.unwrap(), JobStatus::Cancelled);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_marks_job_failed() {
        let h = Harness::new(DOWNLOAD_FAIL, vec![], |_| {});
        let (id, handle) = h.submit(standalone("https://youtu.be/gone"));

        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        let job = h.store.get(&id, true).unwrap();
        assert_eq!(job.message, "Download failed: ERROR: Video unavailable");
        assert!(job
            .logs
            .contains(&"ERROR: Download failed: ERROR: Video unavailable".to_string()));
        assert!(!h.registry.contains(&id));
    }

    #[tokio::test]
    async fn test_unconfigured_daemon_fails_job() {
        let h = Harness::new(DOWNLOAD_SINGLE, vec![], |c| c.catalog.url.clear());
        let (id, handle) = h.submit(standalone("https://youtu.be/clip"));

        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        assert_eq!(
            h.store.get(&id, false).unwrap().message,
            "Application has not been configured yet."
        );
    }

    #[tokio::test]
    async fn test_missing_movie_folder_fails_job() {
        let movie = Movie {
            path: None,
            ..alpha_movie(Path::new("/"))
        };
        let h = Harness::new(DOWNLOAD_SINGLE, vec![movie], |_| {});
        let (id, handle) = h.submit(for_movie("1"));

        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        assert_eq!(
            h.store.get(&id, false).unwrap().message,
            "Movie folder not found on disk: "
        );
    }

    #[tokio::test]
    async fn test_unknown_movie_fails_job() {
        let h = Harness::new(DOWNLOAD_SINGLE, vec![], |_| {});
        let (id, handle) = h.submit(for_movie("42"));

        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        let message = h.store.get(&id, false).unwrap().message;
        assert!(message.starts_with("Could not retrieve movie info from Radarr (ID 42)"));
    }
}
