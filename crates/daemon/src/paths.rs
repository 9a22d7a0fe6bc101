//! Target folder resolution and collision-free naming.
//!
//! Catalog paths are reported by a remote service and may not exist as-is on
//! this machine; they are mapped onto local folders through the configured
//! path overrides and library roots.

use fetch_daemon_config::PathOverride;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Error type for folder creation
#[derive(Debug, Error)]
pub enum PathError {
    #[error("failed to create folder '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A resolved folder and whether it was created during resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDir {
    pub path: PathBuf,
    pub created: bool,
}

/// Lexically normalize a path: drop `.`, fold `..`, collapse separators.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path as a `/`-separated string without trailing separator
fn slash_form(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    let trimmed = replaced.trim_end_matches('/');
    if trimmed.is_empty() && replaced.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Resolve a catalog folder path to a usable local directory.
///
/// Tried in order:
/// 1. the path itself when it is a directory (or can be created because its
///    parent exists)
/// 2. each path override, longest remote prefix first, matched on whole
///    path components; the remainder is appended to the local prefix
/// 3. each library root joined with the path's final component
///
/// With `create_if_missing` a candidate is created when its base directory
/// already exists; nothing above an existing directory is ever created.
pub fn resolve_library_path(
    original: &str,
    roots: &[PathBuf],
    overrides: &[PathOverride],
    create_if_missing: bool,
) -> Option<ResolvedDir> {
    let original = original.trim();
    if original.is_empty() {
        return None;
    }

    let ensure = |candidate: &Path, base: Option<&Path>| -> Option<ResolvedDir> {
        if candidate.is_dir() {
            return Some(ResolvedDir {
                path: candidate.to_path_buf(),
                created: false,
            });
        }
        if !create_if_missing {
            return None;
        }
        let base = base.or_else(|| candidate.parent())?;
        if base.as_os_str().is_empty() || !base.is_dir() {
            return None;
        }
        fs::create_dir_all(candidate).ok()?;
        Some(ResolvedDir {
            path: candidate.to_path_buf(),
            created: true,
        })
    };

    let normalized = normalize_lexically(Path::new(original));
    if let Some(found) = ensure(&normalized, normalized.parent()) {
        return Some(found);
    }

    let original_slash = slash_form(&normalized.to_string_lossy());

    let mut ordered: Vec<(String, &PathOverride)> = overrides
        .iter()
        .filter(|o| !o.remote.trim().is_empty() && !o.local.as_os_str().is_empty())
        .map(|o| (slash_form(o.remote.trim()), o))
        .collect();
    ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    for (remote, entry) in ordered {
        let remainder = if original_slash == remote {
            ""
        } else if let Some(rest) = original_slash
            .strip_prefix(remote.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            rest
        } else {
            continue;
        };

        let (candidate, base) = if remainder.is_empty() {
            (entry.local.clone(), entry.local.clone())
        } else {
            let candidate = normalize_lexically(&entry.local.join(remainder));
            let base = candidate
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| entry.local.clone());
            (candidate, base)
        };
        if let Some(found) = ensure(&candidate, Some(&base)) {
            return Some(found);
        }
    }

    let folder_name = original_slash.rsplit('/').next().unwrap_or_default();
    if folder_name.is_empty() {
        return None;
    }
    roots
        .iter()
        .find_map(|root| ensure(&root.join(folder_name), Some(root)))
}

/// First library root that is an existing directory
pub fn select_standalone_root(roots: &[PathBuf]) -> Option<PathBuf> {
    roots
        .iter()
        .find(|root| !root.as_os_str().is_empty() && root.is_dir())
        .cloned()
}

/// A standalone download folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandaloneFolder {
    pub path: PathBuf,
    /// Final folder name, possibly with a ` (n)` suffix
    pub name: String,
    pub created: bool,
}

/// Folder `name` under `root`, creating it if needed.
///
/// An existing directory with that name is reused. Only when the name is
/// taken by a regular file does the folder get a ` (n)` suffix.
pub fn standalone_folder(root: &Path, name: &str) -> Result<StandaloneFolder, PathError> {
    let mut folder_name = name.to_string();
    let mut path = root.join(&folder_name);

    if path.is_file() {
        let mut suffix = 1;
        loop {
            let candidate_name = format!("{} ({})", name, suffix);
            let candidate = root.join(&candidate_name);
            if !candidate.exists() || candidate.is_dir() {
                folder_name = candidate_name;
                path = candidate;
                break;
            }
            suffix += 1;
        }
    }

    let created = !path.is_dir();
    if created {
        fs::create_dir_all(&path).map_err(|source| PathError::CreateDir {
            path: path.clone(),
            source,
        })?;
    }

    Ok(StandaloneFolder {
        path,
        name: folder_name,
        created,
    })
}

/// Whether any entry named `stem.<anything>` exists directly in `dir`
pub fn stem_taken(dir: &Path, stem: &str) -> bool {
    stem_taken_except(dir, stem, &[])
}

fn stem_taken_except(dir: &Path, stem: &str, ignore: &[PathBuf]) -> bool {
    let prefix = format!("{}.", stem);
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| !ignore.iter().any(|p| p == entry.path()))
        .any(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
}

/// Smallest free download stem: `stem`, else `stem (1)`, `stem (2)`, ...
///
/// A stem is free when no entry `stem.*` exists in `dir`.
pub fn unique_stem(dir: &Path, stem: &str) -> String {
    if !stem_taken(dir, stem) {
        return stem.to_string();
    }
    let mut suffix = 1;
    loop {
        let candidate = format!("{} ({})", stem, suffix);
        if !stem_taken(dir, &candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Canonical file name `stem.ext` in `dir`, suffixed ` (n)` while any
/// `stem.*` entry other than those in `ignore` exists.
///
/// Returns the file name and whether a suffix was needed. An empty `ext`
/// yields a bare stem.
pub fn unique_filename(dir: &Path, stem: &str, ext: &str, ignore: &[PathBuf]) -> (String, bool) {
    let file_name = |base: &str| {
        if ext.is_empty() {
            base.to_string()
        } else {
            format!("{}.{}", base, ext)
        }
    };
    let taken =
        |base: &str| stem_taken_except(dir, base, ignore) || dir.join(file_name(base)).exists();

    if !taken(stem) {
        return (file_name(stem), false);
    }
    let mut suffix = 1;
    loop {
        let candidate = format!("{} ({})", stem, suffix);
        if !taken(&candidate) {
            return (file_name(&candidate), true);
        }
        suffix += 1;
    }
}
