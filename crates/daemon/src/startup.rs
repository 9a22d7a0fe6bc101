//! Startup checks for the fetch daemon
//!
//! Provides preflight checks run before the daemon accepts jobs:
//! - yt-dlp availability (fatal when missing)
//! - ffmpeg availability (warning only, needed for merged formats and playlists)
//! - library roots that do not exist (warning only)

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("yt-dlp not available: {0}")]
    YtDlpUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the startup checks found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub ytdlp_version: String,
    pub ffmpeg_available: bool,
    pub missing_roots: Vec<String>,
}

/// Extract the version from `yt-dlp --version` output
///
/// yt-dlp prints a bare date-style version (e.g. `2024.08.06`) on the first
/// non-empty line.
pub fn parse_ytdlp_version(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Check that yt-dlp runs by executing `<ytdlp> --version`
pub fn check_ytdlp_available(ytdlp: &str) -> Result<String, StartupError> {
    let output = Command::new(ytdlp).arg("--version").output().map_err(|e| {
        StartupError::YtDlpUnavailable(format!(
            "{} --version failed; is yt-dlp installed and in PATH? Error: {}",
            ytdlp, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::YtDlpUnavailable(format!(
            "{} --version exited with {}",
            ytdlp, output.status
        )));
    }

    parse_ytdlp_version(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        StartupError::YtDlpUnavailable(format!("{} --version printed nothing", ytdlp))
    })
}

/// Whether the configured ffmpeg can be found
pub fn ffmpeg_available(ffmpeg: &str) -> bool {
    which::which(ffmpeg).is_ok()
}

/// Run all startup checks in order
///
/// Only a missing yt-dlp aborts startup.
pub fn run_startup_checks(cfg: &Config) -> Result<StartupReport, StartupError> {
    let ytdlp_version = check_ytdlp_available(&cfg.fetch.ytdlp_path)?;
    info!(version = %ytdlp_version, "yt-dlp available");

    let ffmpeg_available = ffmpeg_available(&cfg.fetch.ffmpeg_path);
    if !ffmpeg_available {
        warn!(
            ffmpeg = %cfg.fetch.ffmpeg_path,
            "ffmpeg not found; playlist merging will fail and yt-dlp may pick lower quality streams"
        );
    }

    let missing_roots: Vec<String> = cfg
        .library
        .roots
        .iter()
        .filter(|root| !root.is_dir())
        .map(|root| root.display().to_string())
        .collect();
    for root in &missing_roots {
        warn!(root = %root, "library root does not exist");
    }

    if !cfg.is_configured() {
        warn!("catalog URL, API key or library roots missing; jobs will fail until configured");
    }

    Ok(StartupReport {
        ytdlp_version,
        ffmpeg_available,
        missing_roots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_ytdlp_version() {
        assert_eq!(
            parse_ytdlp_version("2024.08.06\n"),
            Some("2024.08.06".to_string())
        );
        assert_eq!(
            parse_ytdlp_version("\n  2023.12.30  \nextra"),
            Some("2023.12.30".to_string())
        );
        assert_eq!(parse_ytdlp_version(""), None);
        assert_eq!(parse_ytdlp_version(" \n\n"), None);
    }

    #[test]
    fn test_missing_ytdlp_is_fatal() {
        let result = check_ytdlp_available("/nonexistent/yt-dlp-binary");
        assert!(matches!(result, Err(StartupError::YtDlpUnavailable(_))));
    }

    #[test]
    fn test_missing_ffmpeg_detected() {
        assert!(!ffmpeg_available("/nonexistent/ffmpeg-binary"));
    }

    #[cfg(unix)]
    #[test]
    fn test_startup_checks_with_fake_tools() {
        use crate::test_support::write_script;

        let temp = tempfile::TempDir::new().unwrap();
        let ytdlp = write_script(temp.path(), "yt-dlp", "echo 2024.08.06");

        let mut cfg = Config::default();
        cfg.fetch.ytdlp_path = ytdlp.to_string_lossy().into_owned();
        cfg.fetch.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
        cfg.library.roots = vec![temp.path().to_path_buf(), temp.path().join("gone")];

        let report = run_startup_checks(&cfg).expect("yt-dlp present");
        assert_eq!(report.ytdlp_version, "2024.08.06");
        assert!(!report.ffmpeg_available);
        assert_eq!(
            report.missing_roots,
            vec![temp.path().join("gone").display().to_string()]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_ytdlp_is_fatal() {
        use crate::test_support::write_script;

        let temp = tempfile::TempDir::new().unwrap();
        let ytdlp = write_script(temp.path(), "yt-dlp", "exit 3");

        let result = check_ytdlp_available(&ytdlp.to_string_lossy());
        assert!(matches!(result, Err(StartupError::YtDlpUnavailable(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_is_first_nonblank_line(
            blanks in 0usize..4,
            version in "[0-9]{4}\\.[0-9]{2}\\.[0-9]{2}",
            tail in "[a-z ]{0,20}",
        ) {
            let output = format!("{}{}\n{}", "\n".repeat(blanks), version, tail);
            prop_assert_eq!(parse_ytdlp_version(&output), Some(version));
        }
    }
}
