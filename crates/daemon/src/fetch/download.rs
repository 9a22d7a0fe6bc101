//! Main yt-dlp download: command line, output line handling and cleanup of
//! the files it leaves behind.

use crate::phase::{Abort, PhaseContext, PhaseResult};
use crate::process::{OutputStream, ProcessSpec, StreamOutcome};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;
use walkdir::WalkDir;

/// Longest failure detail kept in the job message
pub const FAILURE_SUMMARY_LIMIT: usize = 300;

/// Output prefixes that are only interesting when debugging
pub const DEBUG_PREFIXES: [&str; 5] = ["[debug]", "[info]", "[extractor]", "[metadata]", "[youtube]"];

/// Suffixes of partially downloaded files
pub const FRAGMENT_SUFFIXES: [&str; 2] = [".part", ".ytdl"];

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)%").expect("static regex"))
}

fn format_fragment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.f\d+\.\w+$").expect("static regex"))
}

/// Build the yt-dlp download command, run from `download_dir`.
///
/// `yt-dlp [--cookies F] --newline -f <selector>
/// (--yes-playlist|--no-playlist) -o <template> <url>`
pub fn download_command(
    ytdlp: &str,
    cookie: Option<&Path>,
    format_selector: &str,
    playlist: bool,
    template: &Path,
    url: &str,
    download_dir: &Path,
) -> ProcessSpec {
    let mut spec = ProcessSpec::new(ytdlp);
    if let Some(cookie) = cookie {
        spec = spec.arg("--cookies").arg(cookie);
    }
    spec.arg("--newline")
        .args(["-f", format_selector])
        .arg(if playlist { "--yes-playlist" } else { "--no-playlist" })
        .arg("-o")
        .arg(template)
        .arg(url)
        .current_dir(download_dir)
}

/// How a tool output line is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `[download]` progress bar line
    Progress,
    Error,
    Warning,
    Info,
    Debug,
}

/// Classification of one output line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifiedLine {
    /// Percentage found anywhere in the line
    pub progress: Option<f64>,
    pub kind: LineKind,
}

/// Classify a yt-dlp output line.
///
/// A percentage always updates progress, but only `[download]` lines are
/// treated as progress bars; other lines carrying a percentage fall through
/// to the error, warning and prefix checks.
pub fn classify_line(line: &str) -> ClassifiedLine {
    let progress = progress_re()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    let kind = if progress.is_some() && line.starts_with("[download]") {
        LineKind::Progress
    } else {
        let lowered = line.to_lowercase();
        if lowered.contains("error") {
            LineKind::Error
        } else if lowered.contains("warning") {
            LineKind::Warning
        } else if line.starts_with("[download]") || line.starts_with("[ffmpeg]") {
            LineKind::Info
        } else if DEBUG_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
            LineKind::Debug
        } else {
            LineKind::Info
        }
    };

    ClassifiedLine { progress, kind }
}

/// Writes classified tool output into the job log.
///
/// In compact mode consecutive progress bars share a single log entry: the
/// first one is appended and each later one replaces the newest entry.
#[derive(Debug)]
pub struct ProgressLog {
    compact: bool,
    active: bool,
    last_line: Option<String>,
    last_stderr: Option<String>,
}

impl ProgressLog {
    pub fn new(compact: bool) -> Self {
        Self {
            compact,
            active: false,
            last_line: None,
            last_stderr: None,
        }
    }

    /// Failure summary: the last stderr line, else the last line of any stream
    pub fn failure_summary(&self) -> Option<&str> {
        self.last_stderr.as_deref().or(self.last_line.as_deref())
    }

    pub fn handle(&mut self, ctx: &PhaseContext, source: OutputStream, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.last_line = Some(line.to_string());
        if source == OutputStream::Stderr {
            self.last_stderr = Some(line.to_string());
        }

        let classified = classify_line(line);
        if let Some(value) = classified.progress {
            ctx.log.progress(value);
        }

        match classified.kind {
            LineKind::Progress => {
                if self.compact && self.active {
                    ctx.log.replace_last(line);
                } else {
                    ctx.log.raw(line);
                    self.active = true;
                }
            }
            LineKind::Error => ctx.log.error(line),
            LineKind::Warning => ctx.log.warn(line),
            LineKind::Debug => ctx.log.debug(line),
            LineKind::Info => ctx.log.info(line),
        }
    }
}

pub fn is_fragment(path: &Path) -> bool {
    let name = path.to_string_lossy();
    FRAGMENT_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Leftovers of format merging: `*.temp`, `*.temp.*` and `*.f<id>.<ext>`
pub fn is_intermediate(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    name.ends_with(".temp") || name.contains(".temp.") || format_fragment_re().is_match(&name)
}

/// Files a download is expected to produce: `stem.*` in a directory, or any
/// `*.*` file when no stem is fixed (playlist staging directories).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPattern {
    pub dir: PathBuf,
    pub stem: Option<String>,
}

impl OutputPattern {
    pub fn for_stem(dir: &Path, stem: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem: Some(stem.to_string()),
        }
    }

    pub fn any_in(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem: None,
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        match &self.stem {
            Some(stem) => file_name
                .strip_prefix(stem.as_str())
                .is_some_and(|rest| rest.starts_with('.')),
            None => !file_name.starts_with('.') && file_name.contains('.'),
        }
    }

    /// Regular files matching the pattern, sorted by path
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| self.matches(&e.file_name().to_string_lossy()))
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    }

    /// Matching files that are not partial fragments
    pub fn completed(&self) -> Vec<PathBuf> {
        self.files().into_iter().filter(|p| !is_fragment(p)).collect()
    }

    /// Delete fragment files, returning how many were removed
    pub fn purge_fragments(&self) -> usize {
        self.files()
            .into_iter()
            .filter(|p| is_fragment(p))
            .filter(|p| fs::remove_file(p).is_ok())
            .count()
    }
}

/// Delete a file. A file that is already gone is fine; other failures are
/// logged and otherwise ignored.
pub fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

/// Delete files with [`remove_quietly`]
pub fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        remove_quietly(path);
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Run the download and return the completed output files.
///
/// Fragments matching `pattern` are purged whenever the download aborts.
pub async fn run_download(
    ctx: &PhaseContext,
    spec: &ProcessSpec,
    pattern: &OutputPattern,
) -> PhaseResult<Vec<PathBuf>> {
    ctx.checkpoint()?;

    let mut progress = ProgressLog::new(!ctx.debug_mode);
    let outcome = ctx
        .supervisor
        .stream_lines(spec, |source, line| progress.handle(ctx, source, line))
        .await;

    let code = match outcome {
        Err(e) => {
            pattern.purge_fragments();
            return Err(Abort::failed(format!("Failed to invoke yt-dlp: {}", e)));
        }
        Ok(StreamOutcome::Cancelled) => {
            pattern.purge_fragments();
            return ctx.cancelled();
        }
        Ok(StreamOutcome::Exited(code)) => code,
    };

    if code != Some(0) {
        let status = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        ctx.log.info(&format!("yt-dlp exited with code {}.", status));
        pattern.purge_fragments();
        let summary = progress.failure_summary().unwrap_or("Download failed.");
        return Err(Abort::failed(format!(
            "Download failed: {}",
            truncate_chars(summary, FAILURE_SUMMARY_LIMIT)
        )));
    }

    let downloaded = pattern.completed();

    if ctx.is_cancelled() {
        remove_files(&downloaded);
        pattern.purge_fragments();
        return ctx.cancelled();
    }

    if downloaded.is_empty() {
        return Err(Abort::failed(
            "Download completed but the output file could not be located.",
        ));
    }

    Ok(downloaded)
}
