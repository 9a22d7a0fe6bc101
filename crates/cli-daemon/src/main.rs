//! CLI entry point for the fetch daemon
//!
//! Parses command line arguments, sets up logging and starts the daemon.

use clap::Parser;
use fetch_daemon::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Fetch daemon - yt-dlp downloads into a Radarr library
#[derive(Parser, Debug)]
#[command(name = "fetchd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the HTTP listen address
    #[arg(short, long)]
    bind: Option<String>,

    /// Skip startup checks (yt-dlp availability). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_tracing(debug_mode: bool) {
    let default_level = if debug_mode { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    init_tracing(config.fetch.debug_mode);
    info!(config = %args.config.display(), "fetch daemon starting");

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = fetch_daemon::run_startup_checks(&config) {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    let daemon = match Daemon::with_config(config) {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = daemon.run_with_server().await {
        error!("Daemon error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
