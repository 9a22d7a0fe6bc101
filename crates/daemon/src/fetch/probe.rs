//! Metadata probe: asks yt-dlp what it would download without downloading.
//!
//! The probe is best effort. A timeout, a non-zero exit or unparsable
//! output only produce a warning and the job continues without metadata.

use crate::naming::format_filesize;
use crate::phase::{PhaseContext, PhaseResult};
use crate::process::{CollectOutcome, ProcessSpec};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

/// Entry types that describe a container rather than a single video
const CONTAINER_TYPES: [&str; 3] = ["playlist", "multi_video", "multi"];

/// Build the yt-dlp probe command line.
///
/// `yt-dlp [--cookies F] -f <selector> --skip-download
/// (--yes-playlist|--no-playlist) --print-json <url>`
pub fn probe_command(
    ytdlp: &str,
    cookie: Option<&Path>,
    format_selector: &str,
    playlist: bool,
    url: &str,
) -> ProcessSpec {
    let mut spec = ProcessSpec::new(ytdlp);
    if let Some(cookie) = cookie {
        spec = spec.arg("--cookies").arg(cookie);
    }
    spec.args(["-f", format_selector, "--skip-download"])
        .arg(if playlist { "--yes-playlist" } else { "--no-playlist" })
        .arg("--print-json")
        .arg(url)
}

/// Parse probe stdout into JSON objects.
///
/// Every non-empty line is tried as a JSON object; lines that are not are
/// skipped. When no line parses the whole output is tried as one document.
pub fn parse_probe_output(stdout: &str) -> Vec<Map<String, Value>> {
    let mut entries: Vec<Map<String, Value>> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
        .collect();

    if entries.is_empty() && !stdout.trim().is_empty() {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(stdout) {
            entries.push(map);
        }
    }
    entries
}

fn entry_type(entry: &Map<String, Value>) -> String {
    entry
        .get("_type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or("video")
        .to_lowercase()
}

/// Pick the entry that describes the media to download.
///
/// The last entry that is not a playlist container wins; when every entry
/// is a container the last one is used.
pub fn select_entry(entries: &[Map<String, Value>]) -> Option<&Map<String, Value>> {
    entries
        .iter()
        .rev()
        .find(|entry| !CONTAINER_TYPES.contains(&entry_type(entry).as_str()))
        .or_else(|| entries.last())
}

fn non_empty_str<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Codec string unless absent or the literal `none`
fn codec<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    non_empty_str(map, key).filter(|c| *c != "none")
}

fn positive_number(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64).filter(|n| *n > 0.0)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resolution(width: Option<f64>, height: Option<f64>) -> String {
    match (width, height) {
        (Some(w), Some(h)) => format!("{}x{}", w as i64, h as i64),
        _ => "unknown".to_string(),
    }
}

/// Selected format as reported by the probe
#[derive(Debug, Clone, PartialEq)]
pub struct FormatSummary {
    pub format_id: String,
    pub resolution: String,
    pub video_codec: String,
    pub audio_codec: String,
    /// Human readable size, `unknown` when not reported
    pub filesize: String,
}

impl FormatSummary {
    /// Summarize the formats yt-dlp selected for `info`.
    ///
    /// With `requested_formats` (separate video and audio streams) ids are
    /// joined with `+` and sizes are summed; otherwise the top-level fields
    /// describe the single format.
    pub fn from_info(info: &Map<String, Value>) -> Self {
        let requested: Vec<&Map<String, Value>> = info
            .get("requested_formats")
            .and_then(Value::as_array)
            .map(|formats| formats.iter().filter_map(Value::as_object).collect())
            .unwrap_or_default();

        if requested.is_empty() {
            return Self {
                format_id: info
                    .get("format_id")
                    .and_then(id_string)
                    .unwrap_or_else(|| "unknown".to_string()),
                resolution: resolution(
                    positive_number(info, "width"),
                    positive_number(info, "height"),
                ),
                video_codec: codec(info, "vcodec").unwrap_or("unknown").to_string(),
                audio_codec: codec(info, "acodec").unwrap_or("unknown").to_string(),
                filesize: format_filesize(
                    positive_number(info, "filesize")
                        .or_else(|| positive_number(info, "filesize_approx")),
                ),
            };
        }

        let video = requested.iter().find(|f| codec(f, "vcodec").is_some());
        let audio = requested.iter().find(|f| codec(f, "acodec").is_some());

        let ids: Vec<String> = requested
            .iter()
            .filter_map(|f| f.get("format_id").and_then(id_string))
            .collect();

        let (width, height) = match video {
            Some(v) => (
                positive_number(v, "width").or_else(|| positive_number(info, "width")),
                positive_number(v, "height").or_else(|| positive_number(info, "height")),
            ),
            None => (positive_number(info, "width"), positive_number(info, "height")),
        };

        let sizes: Vec<f64> = requested
            .iter()
            .filter_map(|f| {
                positive_number(f, "filesize").or_else(|| positive_number(f, "filesize_approx"))
            })
            .collect();
        let total = (!sizes.is_empty()).then(|| sizes.iter().sum());

        Self {
            format_id: if ids.is_empty() {
                "unknown".to_string()
            } else {
                ids.join("+")
            },
            resolution: resolution(width, height),
            video_codec: video
                .and_then(|v| codec(v, "vcodec"))
                .or_else(|| codec(info, "vcodec"))
                .unwrap_or("unknown")
                .to_string(),
            audio_codec: audio
                .and_then(|a| codec(a, "acodec"))
                .or_else(|| codec(info, "acodec"))
                .unwrap_or("unknown")
                .to_string(),
            filesize: format_filesize(total),
        }
    }

    /// One-line description for the job log
    pub fn log_line(&self) -> String {
        format!(
            "Resolved YouTube format: id={}, resolution={}, video_codec={}, audio_codec={}, filesize={}",
            self.format_id, self.resolution, self.video_codec, self.audio_codec, self.filesize
        )
    }

    /// Job metadata entries; unknown values are left out
    pub fn metadata_entries(&self) -> Vec<String> {
        let mut entries = Vec::new();
        if !self.format_id.is_empty() {
            entries.push(format!("Format ID: {}", self.format_id));
        }
        for (label, value) in [
            ("Resolution", &self.resolution),
            ("Video Codec", &self.video_codec),
            ("Audio Codec", &self.audio_codec),
            ("Filesize", &self.filesize),
        ] {
            if !value.is_empty() && value != "unknown" {
                entries.push(format!("{}: {}", label, value));
            }
        }
        entries
    }
}

/// Metadata of the media a job is about to download
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    pub entry: Map<String, Value>,
    pub summary: FormatSummary,
}

impl ProbeInfo {
    pub fn from_entry(entry: Map<String, Value>) -> Self {
        let summary = FormatSummary::from_info(&entry);
        Self { entry, summary }
    }

    pub fn title(&self) -> Option<&str> {
        non_empty_str(&self.entry, "title")
    }

    /// Name of the playlist the entry belongs to, falling back to its title
    pub fn playlist_title(&self) -> Option<&str> {
        non_empty_str(&self.entry, "playlist_title")
            .or_else(|| non_empty_str(&self.entry, "playlist"))
            .or_else(|| self.title())
    }

    /// Title appropriate for the playlist mode
    pub fn display_title(&self, merge_playlist: bool) -> Option<&str> {
        if merge_playlist {
            self.playlist_title()
        } else {
            self.title()
        }
    }
}

/// Run the probe and return what it found.
///
/// Only cancellation aborts the job; every other problem is logged as a
/// single warning and yields `Ok(None)`.
pub async fn fetch_metadata(
    ctx: &PhaseContext,
    spec: &ProcessSpec,
    timeout: Duration,
) -> PhaseResult<Option<ProbeInfo>> {
    ctx.checkpoint()?;
    ctx.log
        .info("Fetching YouTube metadata to determine output naming and formats.");

    let budget = (!timeout.is_zero()).then_some(timeout);
    let output = match ctx.supervisor.collect(spec, budget).await {
        Ok(output) => output,
        Err(e) => {
            ctx.log
                .warn(&format!("Failed to query format details via yt-dlp: {}", e));
            ctx.checkpoint()?;
            return Ok(None);
        }
    };

    match output.outcome {
        CollectOutcome::Cancelled => return ctx.cancelled(),
        CollectOutcome::TimedOut => {
            ctx.checkpoint()?;
            ctx.log.warn(&format!(
                "yt-dlp metadata query exceeded {} seconds; continuing without metadata.",
                timeout.as_secs()
            ));
            return Ok(None);
        }
        CollectOutcome::Exited(code) => {
            ctx.checkpoint()?;
            if code != Some(0) {
                let status = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                ctx.log.warn(&format!(
                    "yt-dlp metadata query exited with status {}; continuing without metadata.",
                    status
                ));
                return Ok(None);
            }
        }
    }

    let entries = parse_probe_output(&output.stdout_lossy());
    if ctx.debug_mode && !entries.is_empty() {
        let types: Vec<String> = entries.iter().map(entry_type).collect();
        ctx.log
            .debug(&format!("yt-dlp metadata candidates: {}", types.join(", ")));
    }
    for line in output.stderr_lossy().trim().lines() {
        ctx.log.debug(&format!("yt-dlp metadata: {}", line));
    }

    let info = select_entry(&entries).cloned().map(ProbeInfo::from_entry);
    if info.is_some() {
        ctx.log.info("YouTube metadata retrieved successfully.");
    }
    Ok(info)
}
