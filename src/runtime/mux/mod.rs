//! Readiness-multiplexed strategies built on mio (epoll/kqueue).
//!
//! - `muxbasic`: one event loop on the calling thread.
//! - `muxscale`: a pool of event loops, each on its own thread with its own
//!   `SO_REUSEPORT` listener, so the kernel spreads connections across them.
//!   Cycles are serialized per worker and run in parallel across workers.

mod event_loop;

use crate::session::ServerContext;
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// Run a single event loop on the current thread.
pub fn run(listener: TcpListener, ctx: Arc<ServerContext>, max_connections: usize) -> io::Result<()> {
    event_loop::worker_loop(0, listener, &ctx, max_connections)
}

/// Run one event loop per listener, each on a dedicated thread.
pub fn run_workers(
    listeners: Vec<TcpListener>,
    ctx: Arc<ServerContext>,
    max_connections: usize,
) -> io::Result<()> {
    info!(workers = listeners.len(), "Starting worker pool");

    let mut handles = Vec::with_capacity(listeners.len());

    for (worker_id, listener) in listeners.into_iter().enumerate() {
        let ctx = Arc::clone(&ctx);

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = event_loop::worker_loop(worker_id, listener, &ctx, max_connections) {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}
