//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Default yt-dlp format selection.
///
/// Biased toward H.264/AAC streams at the highest available resolution because
/// the "best" AV1 streams are frequently low bitrate.
pub const DEFAULT_FORMAT_SELECTOR: &str = concat!(
    "bestvideo[height>=2160][vcodec^=avc1]+bestaudio[acodec^=mp4a]/",
    "bestvideo[height>=1440][vcodec^=avc1]+bestaudio[acodec^=mp4a]/",
    "bestvideo[height>=1080][vcodec^=avc1]+bestaudio[acodec^=mp4a]/",
    "bestvideo[height>=720][vcodec^=avc1]+bestaudio[acodec^=mp4a]/",
    "bestvideo[height>=2160]+bestaudio/",
    "bestvideo[height>=1440]+bestaudio/",
    "bestvideo[height>=1080]+bestaudio/",
    "bestvideo[height>=720]+bestaudio/",
    "95/",
    "best"
);

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// A remote to local path prefix rewrite.
///
/// Used when the catalog records folder paths as seen from another host
/// (e.g. `/data/movies` inside a container) that are mounted elsewhere locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathOverride {
    /// Prefix as reported by the catalog
    pub remote: String,
    /// Local replacement for the prefix
    pub local: PathBuf,
}

/// Library locations
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LibraryConfig {
    /// Library roots, in order of preference
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    /// Remote to local path rewrites
    #[serde(default)]
    pub path_overrides: Vec<PathOverride>,
}

/// Catalog (Radarr) connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogConfig {
    /// Base URL, without trailing slash
    #[serde(default)]
    pub url: String,
    /// API key sent as `X-Api-Key`
    #[serde(default)]
    pub api_key: String,
    /// Request timeout in seconds (default 10)
    #[serde(default = "default_catalog_timeout_secs")]
    pub timeout_secs: u64,
    /// How long the movie list stays cached (default 90)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_catalog_timeout_secs() -> u64 {
    10
}

fn default_cache_ttl_secs() -> u64 {
    90
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout_secs: default_catalog_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Settings for the external fetch and merge tools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchConfig {
    /// yt-dlp executable (default "yt-dlp")
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,
    /// ffmpeg executable used for playlist merging (default "ffmpeg")
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Netscape cookie file, absolute or relative to the config directory
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,
    /// yt-dlp `-f` expression
    #[serde(default = "default_format_selector")]
    pub format_selector: String,
    /// Wall-clock budget for the metadata probe (default 120)
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    /// Keep every progress line and debug output in job logs
    #[serde(default)]
    pub debug_mode: bool,
}

fn default_ytdlp_path() -> String {
    "yt-dlp".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_format_selector() -> String {
    DEFAULT_FORMAT_SELECTOR.to_string()
}

fn default_metadata_timeout_secs() -> u64 {
    120
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: default_ytdlp_path(),
            ffmpeg_path: default_ffmpeg_path(),
            cookie_file: None,
            format_selector: default_format_selector(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            debug_mode: false,
        }
    }
}

/// Job store and scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// JSON file holding the job history
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Maximum number of jobs kept in the store (default 50)
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Maximum number of log lines kept per job (default 500)
    #[serde(default = "default_max_logs")]
    pub max_logs: usize,
    /// Maximum concurrently running jobs (0 = unbounded)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("jobs.json")
}

fn default_max_items() -> usize {
    50
}

fn default_max_logs() -> usize {
    500
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            max_items: default_max_items(),
            max_logs: default_max_logs(),
            max_concurrent_jobs: 0,
        }
    }
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address (default 127.0.0.1:7879)
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Directory relative paths are resolved against (the config file's parent)
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Relative paths inside the file (state file, cookie file) are resolved
    /// against the directory containing it.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config = Self::parse_toml(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RADARR_URL -> catalog.url
    /// - RADARR_API_KEY -> catalog.api_key
    /// - FETCHD_DEBUG -> fetch.debug_mode (any non-blank value enables it)
    /// - YT_COOKIE_FILE -> fetch.cookie_file
    /// - FETCHD_LIBRARY_ROOTS -> library.roots (platform path-list syntax)
    /// - FETCHD_MAX_CONCURRENT_JOBS -> jobs.max_concurrent_jobs
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RADARR_URL") {
            if !val.trim().is_empty() {
                self.catalog.url = val;
            }
        }

        if let Ok(val) = env::var("RADARR_API_KEY") {
            if !val.trim().is_empty() {
                self.catalog.api_key = val;
            }
        }

        if let Ok(val) = env::var("FETCHD_DEBUG") {
            // Accept "false", "0", "no" as an explicit off switch
            match val.trim().to_lowercase().as_str() {
                "" => {}
                "false" | "0" | "no" => self.fetch.debug_mode = false,
                _ => self.fetch.debug_mode = true,
            }
        }

        if let Ok(val) = env::var("YT_COOKIE_FILE") {
            if !val.trim().is_empty() {
                self.fetch.cookie_file = Some(PathBuf::from(val.trim()));
            }
        }

        if let Some(val) = env::var_os("FETCHD_LIBRARY_ROOTS") {
            let roots: Vec<PathBuf> = env::split_paths(&val)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !roots.is_empty() {
                self.library.roots = roots;
            }
        }

        if let Ok(val) = env::var("FETCHD_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.jobs.max_concurrent_jobs = jobs;
            }
        }
    }

    /// Clean up values that may have been entered loosely
    ///
    /// Strips the catalog URL's trailing slash, trims the API key,
    /// de-duplicates library roots and normalizes path overrides.
    pub fn normalize(&mut self) {
        self.catalog.url = self.catalog.url.trim().trim_end_matches('/').to_string();
        self.catalog.api_key = self.catalog.api_key.trim().to_string();

        let mut roots: Vec<PathBuf> = Vec::new();
        for root in self.library.roots.drain(..) {
            if root.as_os_str().is_empty() || roots.contains(&root) {
                continue;
            }
            roots.push(root);
        }
        self.library.roots = roots;

        self.library.path_overrides =
            normalize_path_overrides(std::mem::take(&mut self.library.path_overrides));
    }

    /// Load configuration from file, apply environment overrides and normalize
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.normalize();
        Ok(config)
    }

    /// True when the catalog is reachable and at least one library root is set
    pub fn is_configured(&self) -> bool {
        !self.catalog.url.is_empty()
            && !self.catalog.api_key.is_empty()
            && !self.library.roots.is_empty()
    }

    /// Resolve a possibly relative path against the config directory
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Location of the job history file
    pub fn state_file(&self) -> PathBuf {
        self.resolve_path(&self.jobs.state_file)
    }

    /// Cookie file handed to yt-dlp, only when it actually exists
    pub fn cookie_path(&self) -> Option<PathBuf> {
        let configured = self.fetch.cookie_file.as_ref()?;
        if configured.as_os_str().is_empty() {
            return None;
        }
        let absolute = self.resolve_path(configured);
        absolute.is_file().then_some(absolute)
    }
}

/// Split a `remote => local` line into its two halves.
///
/// `=>`, `->` and `,` are accepted as separators, in that order of preference.
fn split_override_line(cleaned: &str) -> Option<(&str, &str)> {
    ["=>", "->", ","]
        .iter()
        .find_map(|sep| cleaned.split_once(sep))
        .map(|(remote, local)| (remote.trim(), local.trim()))
}

/// Parse newline separated override definitions of the form `remote => local`.
///
/// Returns the parsed overrides and one message per rejected line.
pub fn parse_path_overrides(raw: &str) -> (Vec<PathOverride>, Vec<String>) {
    let mut overrides = Vec::new();
    let mut errors = Vec::new();

    for (index, line) in raw.lines().enumerate() {
        let line_number = index + 1;
        let cleaned = line.trim();
        if cleaned.is_empty() {
            continue;
        }
        match split_override_line(cleaned) {
            None => errors.push(format!(
                "Path override line {} must use 'remote => local' format: {:?}",
                line_number, cleaned
            )),
            Some((remote, local)) if remote.is_empty() || local.is_empty() => {
                errors.push(format!(
                    "Path override line {} is missing a remote or local path: {:?}",
                    line_number, cleaned
                ))
            }
            Some((remote, local)) => overrides.push(PathOverride {
                remote: remote.to_string(),
                local: PathBuf::from(local),
            }),
        }
    }

    (overrides, errors)
}

/// Sanitize and de-duplicate path overrides.
///
/// Trailing separators are stripped from the remote prefix (a bare `/` is
/// kept), entries with an empty side are dropped.
pub fn normalize_path_overrides(overrides: Vec<PathOverride>) -> Vec<PathOverride> {
    let mut normalized: Vec<PathOverride> = Vec::new();
    for entry in overrides {
        let remote = entry.remote.trim();
        let local = entry.local.to_string_lossy().trim().to_string();
        if remote.is_empty() || local.is_empty() {
            continue;
        }
        let mut stripped = remote.trim_end_matches(['/', '\\']);
        if stripped.is_empty() {
            stripped = remote;
        }
        let record = PathOverride {
            remote: stripped.to_string(),
            local: PathBuf::from(local),
        };
        if !normalized.contains(&record) {
            normalized.push(record);
        }
    }
    normalized
}
