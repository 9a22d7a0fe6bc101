//! Joins downloaded playlist segments into one file with ffmpeg's concat
//! demuxer, copying streams without re-encoding.

use crate::fetch::download::remove_quietly;
use crate::phase::{Abort, PhaseContext, PhaseResult};
use crate::process::{CollectOutcome, ProcessSpec};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the concat manifest inside the staging directory
pub const MANIFEST_NAME: &str = "concat.txt";

/// Prefix of per-job playlist staging directories
pub const STAGING_PREFIX: &str = ".fetchd_playlist_";

/// yt-dlp output template for playlist segments
pub const SEGMENT_TEMPLATE: &str = "%(playlist_index)05d - %(title)s.%(ext)s";

/// Error type for manifest preparation
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Failed to prepare playlist merge manifest: {0}")]
    Manifest(#[source] std::io::Error),
}

/// Staging directory for a job's playlist segments
pub fn staging_dir(download_dir: &Path, job_id: &str) -> PathBuf {
    download_dir.join(format!("{}{}", STAGING_PREFIX, job_id))
}

/// Quote a path for a concat manifest `file '...'` line
pub fn escape_concat_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
}

/// Write the concat manifest listing `segments` in order.
pub fn write_manifest(staging: &Path, segments: &[PathBuf]) -> Result<PathBuf, MergeError> {
    let mut content = String::new();
    for segment in segments {
        let absolute = std::path::absolute(segment).unwrap_or_else(|_| segment.clone());
        let _ = writeln!(content, "file '{}'", escape_concat_path(&absolute));
    }
    let manifest = staging.join(MANIFEST_NAME);
    fs::write(&manifest, content).map_err(MergeError::Manifest)?;
    Ok(manifest)
}

/// Merged output path, using the first segment's extension (default `.mp4`)
pub fn merged_output_path(staging: &Path, segments: &[PathBuf]) -> PathBuf {
    let ext = segments
        .first()
        .and_then(|s| s.extension())
        .map(|e| e.to_string_lossy().into_owned())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| "mp4".to_string());
    staging.join(format!("merged.{}", ext))
}

/// `ffmpeg -y -f concat -safe 0 -i <manifest> -c copy <output>`
pub fn merge_command(ffmpeg: &Path, manifest: &Path, output: &Path) -> ProcessSpec {
    ProcessSpec::new(ffmpeg)
        .args(["-y", "-f", "concat", "-safe", "0", "-i"])
        .arg(manifest)
        .args(["-c", "copy"])
        .arg(output)
}

/// Merge the downloaded segments and return the merged file.
///
/// On success the segments and the manifest are deleted; the staging
/// directory itself is left for the caller, which moves the merged file out
/// first.
pub async fn merge_segments(
    ctx: &PhaseContext,
    ffmpeg: &str,
    staging: &Path,
    mut segments: Vec<PathBuf>,
) -> PhaseResult<PathBuf> {
    let ffmpeg = which::which(ffmpeg).map_err(|_| {
        Abort::failed("ffmpeg is required to merge playlist videos but was not found.")
    })?;

    segments.sort();
    ctx.log.info(&format!(
        "Merging playlist videos with ffmpeg (segments: {}).",
        segments.len()
    ));

    ctx.checkpoint()?;
    let manifest =
        write_manifest(staging, &segments).map_err(|e| Abort::failed(e.to_string()))?;
    let output = merged_output_path(staging, &segments);

    ctx.checkpoint()?;
    let spec = merge_command(&ffmpeg, &manifest, &output);
    let collected = ctx.supervisor.collect(&spec, None).await.map_err(|e| {
        Abort::failed(format!("Failed to invoke ffmpeg for playlist merge: {}", e))
    })?;

    for line in collected
        .stdout_lossy()
        .trim()
        .lines()
        .chain(collected.stderr_lossy().trim().lines())
    {
        ctx.log.debug(&format!("ffmpeg: {}", line));
    }

    if collected.outcome == CollectOutcome::Cancelled || ctx.is_cancelled() {
        remove_quietly(&output);
        return ctx.cancelled();
    }

    if collected.outcome != CollectOutcome::Exited(Some(0)) || !output.exists() {
        return Err(Abort::failed(
            "Failed to merge playlist videos into a single file.",
        ));
    }

    ctx.log.info("Merging playlist videos completed successfully.");

    remove_quietly(&manifest);
    for segment in segments.iter().filter(|s| **s != output) {
        remove_quietly(segment);
    }

    if ctx.is_cancelled() {
        remove_quietly(&output);
        return ctx.cancelled();
    }

    Ok(output)
}
