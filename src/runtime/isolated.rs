//! Process-isolated strategy.
//!
//! Every accepted connection is handed to its own named thread, which owns
//! the socket and the session until the client goes away. The accept loop
//! never touches per-connection state. Session threads are detached: they
//! are reclaimed as soon as they return, and a session that fails or panics
//! (unwinding) cannot reach the acceptor or its siblings.
//!
//! Isolation stops at the process boundary: a session that aborts the
//! process (stack overflow, panic with `panic = "abort"`) takes down the
//! acceptor and every other session with it.

use crate::session::ServerContext;
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

/// Accept connections forever, one execution context per connection.
pub fn run(listener: TcpListener, ctx: Arc<ServerContext>) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "Listening for clients");

    loop {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let mut session = ctx.open_session();
                let client = session.client_id();
                debug!(client, peer = %peer, "New connection");

                let ctx = Arc::clone(&ctx);
                let spawned = thread::Builder::new()
                    .name(format!("client-{client}"))
                    .spawn(move || session.run(&mut stream, &ctx.dispatcher));

                if let Err(e) = spawned {
                    error!(client, error = %e, "Failed to start session");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
