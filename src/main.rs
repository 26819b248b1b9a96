//! mathserver: a remote compute server.
//!
//! Clients connect over TCP, name one of two compute jobs (`kmeans` or
//! `matinv`), optionally upload an input file, and receive the job's result
//! file back.
//!
//! Features:
//! - Three connection strategies: per-connection threads, a single mio
//!   readiness loop, or a pool of readiness loops
//! - Length-prefixed file transfer in both directions
//! - Per-client result directories
//! - Optional daemon mode with file logging
//! - Configuration via CLI arguments or TOML file

mod config;
mod daemon;
mod dispatch;
mod protocol;
mod runtime;
mod session;

#[cfg(test)]
mod testutil;

use config::Config;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration; relative paths are resolved here, before detaching
    let config = Config::load()?;

    // Opened while the terminal is still attached so failures are visible
    let log_file = if config.daemon {
        Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.log_file)?,
        )
    } else {
        None
    };

    if config.daemon {
        daemon::detach()?;
    }

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match log_file {
        Some(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
            info!(pid = std::process::id(), "Detached from terminal");
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }

    info!(
        host = %config.host,
        port = config.port,
        strategy = ?config.strategy,
        daemon = config.daemon,
        "Starting mathserver"
    );

    if let Err(e) = runtime::run(&config) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }
    Ok(())
}
