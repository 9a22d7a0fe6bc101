//! HTTP API for the fetch daemon
//!
//! Exposes job submission, listing, inspection and cancellation as JSON
//! endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::daemon::{CancelError, Daemon, SubmitError};
use crate::jobs::JobRequest;

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server stopped unexpectedly: {0}")]
    Serve(#[source] std::io::Error),
}

type AppState = Arc<Daemon>;

/// Handler for POST /jobs
async fn create_job(State(daemon): State<AppState>, Json(request): Json<JobRequest>) -> Response {
    match daemon.submit(request) {
        Ok(job) => (StatusCode::CREATED, Json(json!({ "job": job }))).into_response(),
        Err(SubmitError::Invalid(errors)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": errors.join(" "), "errors": errors })),
        )
            .into_response(),
        Err(e @ SubmitError::Store(_)) => {
            error!(error = %e, "job submission failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Handler for GET /jobs
async fn list_jobs(State(daemon): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "jobs": daemon.jobs(),
        "debug_mode": daemon.config().fetch.debug_mode,
    }))
}

/// Handler for GET /jobs/:id
async fn get_job(State(daemon): State<AppState>, Path(job_id): Path<String>) -> Response {
    match daemon.job(&job_id) {
        Some(job) => Json(json!({ "job": job })).into_response(),
        None => not_found(),
    }
}

/// Handler for POST /jobs/:id/cancel
async fn cancel_job(State(daemon): State<AppState>, Path(job_id): Path<String>) -> Response {
    match daemon.cancel(&job_id) {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(json!({ "job": outcome.job, "message": outcome.message })),
        )
            .into_response(),
        Err(CancelError::NotFound) => not_found(),
        Err(e @ (CancelError::NotActive(_) | CancelError::WorkerGone(_))) => {
            let message = e.to_string();
            let job = match e {
                CancelError::NotActive(job) | CancelError::WorkerGone(job) => Some(job),
                CancelError::NotFound => None,
            };
            (
                StatusCode::CONFLICT,
                Json(json!({ "job": job, "message": message })),
            )
                .into_response()
        }
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": CancelError::NotFound.to_string() })),
    )
        .into_response()
}

/// Creates the axum Router with the job endpoints
pub fn create_router(daemon: AppState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .with_state(daemon)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

/// Runs the HTTP server on `bind` until Ctrl-C
pub async fn run_server(daemon: AppState, bind: &str) -> Result<(), ServerError> {
    let app = create_router(daemon);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)
}
