//! Connection acceptor and strategy selection.
//!
//! Strategies:
//! - `fork`: one dedicated execution context per connection
//! - `muxbasic`: single-threaded mio readiness loop, serial request cycles
//! - `muxscale`: pool of mio readiness loops behind `SO_REUSEPORT`
//!
//! All listeners are bound before any strategy starts, so bind and listen
//! failures surface as startup errors.

mod connection;
mod isolated;
pub mod listener;
mod mux;

pub(crate) use connection::{Connection, ConnectionRegistry};

use crate::config::{Config, Strategy};
use crate::session::ServerContext;
use std::io;
use std::sync::Arc;
use tracing::info;

/// Bind the configured address and serve forever with the chosen strategy.
pub fn run(config: &Config) -> io::Result<()> {
    let addr = listener::resolve(&config.listen_addr())?;
    let ctx = Arc::new(ServerContext::new(config));

    info!(
        addr = %addr,
        strategy = ?config.strategy,
        results_dir = %config.results_dir.display(),
        bin_dir = %config.bin_dir.display(),
        "Starting runtime"
    );

    match config.strategy {
        Strategy::Fork => isolated::run(listener::create_listener(addr, false)?, ctx),
        Strategy::Muxbasic => mux::run(
            listener::create_listener(addr, false)?,
            ctx,
            config.max_connections,
        ),
        Strategy::Muxscale => {
            let listeners = (0..config.worker_count())
                .map(|_| listener::create_listener(addr, true))
                .collect::<io::Result<Vec<_>>>()?;
            mux::run_workers(listeners, ctx, config.max_connections)
        }
    }
}
