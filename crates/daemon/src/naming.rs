//! Library naming rules: sanitized filenames, canonical movie stems, extra
//! content labels and the display descriptors shown for a job.

use crate::catalog::Movie;
use crate::jobs::JobRequest;
use regex::Regex;
use std::sync::OnceLock;

/// Fallback stem when a movie has neither title nor usable characters
pub const DEFAULT_MOVIE_STEM: &str = "Movie";

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[\\/:*?"<>|]+"#).expect("static regex"))
}

/// Make a string safe to use as a file or folder name.
///
/// Runs of path separators and reserved characters collapse to a single
/// `_`; surrounding whitespace and trailing dots are removed.
pub fn sanitize_filename(name: &str) -> String {
    let replaced = unsafe_chars().replace_all(name, "_");
    replaced.trim().trim_end_matches('.').to_string()
}

/// Canonical movie stem `Title (Year) {tmdb-ID}`.
///
/// Missing year or TMDb id are omitted. Never returns an empty string.
pub fn build_movie_stem(movie: &Movie) -> String {
    let title = movie.title.trim();
    let mut parts = vec![if title.is_empty() {
        DEFAULT_MOVIE_STEM.to_string()
    } else {
        title.to_string()
    }];

    if let Some(year) = movie.year.filter(|y| *y > 0) {
        parts.push(format!("({})", year));
    }
    if let Some(tmdb) = movie.tmdb_id.filter(|id| *id > 0) {
        parts.push(format!("{{tmdb-{}}}", tmdb));
    }

    let cleaned = sanitize_filename(&parts.join(" "));
    if cleaned.is_empty() {
        DEFAULT_MOVIE_STEM.to_string()
    } else {
        cleaned
    }
}

/// Kind of extra content stored next to a movie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraType {
    Trailer,
    BehindTheScenes,
    Deleted,
    Featurette,
    Interview,
    Scene,
    Short,
    Other,
}

impl ExtraType {
    pub const ALL: [ExtraType; 8] = [
        ExtraType::Trailer,
        ExtraType::BehindTheScenes,
        ExtraType::Deleted,
        ExtraType::Featurette,
        ExtraType::Interview,
        ExtraType::Scene,
        ExtraType::Short,
        ExtraType::Other,
    ];

    /// Canonical request key
    pub fn key(self) -> &'static str {
        match self {
            ExtraType::Trailer => "trailer",
            ExtraType::BehindTheScenes => "behindthescenes",
            ExtraType::Deleted => "deleted",
            ExtraType::Featurette => "featurette",
            ExtraType::Interview => "interview",
            ExtraType::Scene => "scene",
            ExtraType::Short => "short",
            ExtraType::Other => "other",
        }
    }

    /// Human readable label, also used as the canonical filename suffix
    pub fn label(self) -> &'static str {
        match self {
            ExtraType::Trailer => "Trailer",
            ExtraType::BehindTheScenes => "Behind the Scenes",
            ExtraType::Deleted => "Deleted Scene",
            ExtraType::Featurette => "Featurette",
            ExtraType::Interview => "Interview",
            ExtraType::Scene => "Scene",
            ExtraType::Short => "Short",
            ExtraType::Other => "Other",
        }
    }

    /// Subfolder of the movie folder that holds this kind of extra
    pub fn folder(self) -> &'static str {
        match self {
            ExtraType::Trailer => "Trailers",
            ExtraType::BehindTheScenes => "Behind The Scenes",
            ExtraType::Deleted => "Deleted Scenes",
            ExtraType::Featurette => "Featurettes",
            ExtraType::Interview => "Interviews",
            ExtraType::Scene => "Scenes",
            ExtraType::Short => "Shorts",
            ExtraType::Other => "Other",
        }
    }

    /// Exact lookup of a canonical key
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.key() == key)
    }

    /// Lenient lookup accepting plurals and spelling variants.
    ///
    /// Everything but ASCII letters is dropped and the rest lowercased before
    /// matching, so `"Behind the Scenes"` and `"deleted-scenes"` both resolve.
    pub fn parse(raw: &str) -> Option<Self> {
        let token: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if token.is_empty() {
            return None;
        }
        if let Some(found) = Self::from_key(&token) {
            return Some(found);
        }
        let alias = match token.as_str() {
            "trailers" => ExtraType::Trailer,
            "behindthescene" | "behindthescenesclip" | "behindthescenesfeature"
            | "behindthescenesfeaturette" => ExtraType::BehindTheScenes,
            "deletedscene" | "deletedscenes" => ExtraType::Deleted,
            "featurettes" => ExtraType::Featurette,
            "interviews" => ExtraType::Interview,
            "scenes" => ExtraType::Scene,
            "shorts" => ExtraType::Short,
            "extras" => ExtraType::Other,
            _ => return None,
        };
        Some(alias)
    }
}

/// Label of an extra: the user supplied name when present, else the type label
pub fn extra_label(extra_name: &str, extra_type: &str) -> String {
    let name = sanitize_filename(extra_name);
    if !name.is_empty() {
        return name;
    }
    match ExtraType::from_key(extra_type) {
        Some(t) => t.label().to_string(),
        None => capitalize(extra_type),
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

/// Display information derived from a job request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub label: String,
    pub subtitle: String,
    pub metadata: Vec<String>,
}

/// Build the label, subtitle and metadata entries shown for a job.
pub fn describe_job(request: &JobRequest) -> JobDescriptor {
    let standalone = request.standalone;
    let mut movie_label = if request.movie_name.trim().is_empty() {
        request.title.trim().to_string()
    } else {
        request.movie_name.trim().to_string()
    };

    let custom_name = request.standalone_custom_name.trim();
    if standalone && request.standalone_name_mode.trim() == "custom" && !custom_name.is_empty() {
        movie_label = custom_name.to_string();
    }
    if movie_label.is_empty() {
        movie_label = if standalone {
            "Standalone Download".to_string()
        } else {
            "Selected Movie".to_string()
        };
    }

    let extra_type = request.extra_type.trim().to_lowercase();
    let extra_type = if extra_type.is_empty() {
        ExtraType::Trailer.key().to_string()
    } else {
        extra_type
    };
    let extra_name = request.extra_name.trim();
    let label_for_extra = if extra_name.is_empty() {
        match ExtraType::from_key(&extra_type) {
            Some(t) => t.label().to_string(),
            None => capitalize(&extra_type),
        }
    } else {
        extra_name.to_string()
    };

    let (label, subtitle) = if request.extra && !label_for_extra.is_empty() {
        (
            format!("{} – {}", movie_label, label_for_extra),
            format!("Extra • {}", label_for_extra),
        )
    } else {
        (movie_label, String::new())
    };

    let mut metadata = Vec::new();
    if request.extra {
        metadata.push("Stored as extra content".to_string());
    }
    if request.merge_playlist() {
        metadata.push("Playlist merged into single file".to_string());
    }
    if standalone {
        metadata.push("Standalone download (outside Radarr)".to_string());
    }

    JobDescriptor {
        label,
        subtitle,
        metadata,
    }
}

/// Human readable byte size (`1.5 MiB`); `unknown` for missing or non-positive
pub fn format_filesize(bytes: Option<f64>) -> String {
    let Some(mut size) = bytes.filter(|b| b.is_finite() && *b > 0.0) else {
        return "unknown".to_string();
    };
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}
