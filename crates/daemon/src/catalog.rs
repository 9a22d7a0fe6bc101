//! Movie catalog lookups against the library manager (Radarr v3 API).
//!
//! Only the two reads the orchestrator needs are supported: one movie by id
//! and the full movie list, the latter cached for a short time.

use crate::cache::TtlCache;
use async_trait::async_trait;
use fetch_daemon_config::CatalogConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A movie as reported by the catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Movie {
    pub id: i64,
    pub title: String,
    pub year: Option<i64>,
    pub tmdb_id: Option<i64>,
    /// Movie folder as seen by the catalog host
    pub path: Option<String>,
}

/// Error type for catalog requests
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog URL and API key are not configured")]
    NotConfigured,

    #[error("invalid movie id '{0}'")]
    InvalidId(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

/// Read access to the movie catalog
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Fetch a single movie by catalog id.
    async fn movie(&self, id: i64) -> Result<Movie, CatalogError>;

    /// Fetch every movie in the catalog.
    async fn movies(&self) -> Result<Vec<Movie>, CatalogError>;
}

/// Outcome of matching a request to a catalog movie
#[derive(Debug, Clone, PartialEq)]
pub struct MovieMatch {
    pub id: i64,
    /// How the match was made, for the job log; `None` for a direct id
    pub note: Option<String>,
}

/// Find the catalog movie a request refers to.
///
/// A movie id is taken as-is. Otherwise the TMDb id is matched first, then
/// the title (case-insensitive), narrowed by year when one is given. The
/// first match wins.
pub async fn resolve_movie(
    catalog: &dyn Catalog,
    movie_id: &str,
    tmdb: &str,
    title: &str,
    year: &str,
) -> Result<Option<MovieMatch>, CatalogError> {
    let movie_id = movie_id.trim();
    if !movie_id.is_empty() {
        let id = movie_id
            .parse::<i64>()
            .map_err(|_| CatalogError::InvalidId(movie_id.to_string()))?;
        return Ok(Some(MovieMatch { id, note: None }));
    }

    let (tmdb, title, year) = (tmdb.trim(), title.trim(), year.trim());
    if tmdb.is_empty() && title.is_empty() {
        return Ok(None);
    }

    let movies = catalog.movies().await?;

    if !tmdb.is_empty() {
        if let Some(movie) = movies
            .iter()
            .find(|m| m.tmdb_id.is_some_and(|id| id.to_string() == tmdb))
        {
            return Ok(Some(MovieMatch {
                id: movie.id,
                note: Some(format!(
                    "Matched TMDb ID {} to Radarr movie '{}'.",
                    tmdb, movie.title
                )),
            }));
        }
    }

    if !title.is_empty() {
        let lowered = title.to_lowercase();
        let found = movies.iter().find(|m| {
            m.title.to_lowercase() == lowered
                && (year.is_empty() || m.year.is_some_and(|y| y.to_string() == year))
        });
        if let Some(movie) = found {
            let note = if year.is_empty() {
                format!("Matched title '{}' to Radarr movie '{}'.", title, movie.title)
            } else {
                format!(
                    "Matched title '{}' ({}) to Radarr movie '{}'.",
                    title, year, movie.title
                )
            };
            return Ok(Some(MovieMatch {
                id: movie.id,
                note: Some(note),
            }));
        }
    }

    Ok(None)
}

/// Radarr v3 HTTP client
#[derive(Debug)]
pub struct RadarrClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    movies: TtlCache<(), Vec<Movie>>,
}

impl RadarrClient {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            movies: TtlCache::new(Duration::from_secs(config.cache_ttl_secs)),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v3/{}", self.base_url, path)
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, CatalogError>
    where
        T: serde::de::DeserializeOwned,
    {
        if self.base_url.is_empty() || self.api_key.is_empty() {
            return Err(CatalogError::NotConfigured);
        }
        let url = self.endpoint(path);
        debug!(url = %url, "catalog request");

        let response = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Catalog for RadarrClient {
    async fn movie(&self, id: i64) -> Result<Movie, CatalogError> {
        self.get_json(&format!("movie/{}", id)).await
    }

    async fn movies(&self) -> Result<Vec<Movie>, CatalogError> {
        if let Some(cached) = self.movies.get(&()) {
            return Ok(cached);
        }
        let movies: Vec<Movie> = self.get_json("movie").await?;
        self.movies.put((), movies.clone());
        Ok(movies)
    }
}
