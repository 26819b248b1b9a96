//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when the listener or a client is
//! ready. A ready client gets exactly one full request/response cycle, run
//! with the socket switched to blocking mode, before control returns to
//! `poll`. Cycles never overlap within one loop.
//!
//! This strategy is intentionally serial: one slow compute invocation blocks
//! every other connection for its duration.

use crate::runtime::{Connection, ConnectionRegistry};
use crate::session::{Cycle, ServerContext};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 256;

/// Run one event loop on the current thread until a fatal poll error.
pub fn worker_loop(
    worker_id: usize,
    listener: TcpListener,
    ctx: &ServerContext,
    max_connections: usize,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    listener.set_nonblocking(true)?;
    poll.registry().register(
        &mut SourceFd(&listener.as_raw_fd()),
        LISTENER_TOKEN,
        Interest::READABLE,
    )?;

    let mut connections = ConnectionRegistry::new(max_connections);
    let mut closed: Vec<usize> = Vec::new();

    info!(
        worker = worker_id,
        addr = %listener.local_addr()?,
        max_connections,
        "Worker started"
    );

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(&listener, &poll, &mut connections, ctx, worker_id);
                }
                Token(conn_id) => match serve_ready(conn_id, &poll, &mut connections, ctx) {
                    Ok(Cycle::Continue) => {}
                    Ok(Cycle::Closed) => closed.push(conn_id),
                    Err(e) => {
                        debug!(worker = worker_id, conn_id, error = %e, "Connection error");
                        closed.push(conn_id);
                    }
                },
            }
        }

        // Compact the watch set once the round is over.
        for conn_id in closed.drain(..) {
            close_connection(&poll, &mut connections, conn_id);
        }
    }
}

/// Accept every pending connection and start watching it.
fn accept_connections(
    listener: &TcpListener,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    ctx: &ServerContext,
    worker_id: usize,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(error = %e, "Dropping connection");
                    continue;
                }

                let session = ctx.open_session();
                let client = session.client_id();

                let conn_id = match connections.insert(Connection::new(stream, session)) {
                    Ok(conn_id) => conn_id,
                    Err(_) => {
                        warn!(worker = worker_id, client, "Connection limit reached");
                        continue;
                    }
                };

                let fd = match connections.get_mut(conn_id) {
                    Some(conn) => conn.stream.as_raw_fd(),
                    None => continue,
                };
                if let Err(e) =
                    poll.registry()
                        .register(&mut SourceFd(&fd), Token(conn_id), Interest::READABLE)
                {
                    error!(worker = worker_id, client, error = %e, "Failed to watch connection");
                    connections.remove(conn_id);
                    continue;
                }

                info!(
                    worker = worker_id,
                    conn_id,
                    client,
                    peer = %peer,
                    connections = connections.len(),
                    "Accepted connection"
                );
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Pending connections stay in the backlog; without a new edge
                // they would wait for the next client to arrive.
                error!(worker = worker_id, error = %e, "Accept error");
                if let Err(e) = rearm_listener(poll, listener) {
                    error!(worker = worker_id, error = %e, "Failed to re-arm listener");
                }
                break;
            }
        }
    }
}

/// Ask poll to report the listener again if connections are still pending.
fn rearm_listener(poll: &Poll, listener: &TcpListener) -> io::Result<()> {
    poll.registry().reregister(
        &mut SourceFd(&listener.as_raw_fd()),
        LISTENER_TOKEN,
        Interest::READABLE,
    )
}

/// Run one request/response cycle on a ready connection.
fn serve_ready(
    conn_id: usize,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    ctx: &ServerContext,
) -> io::Result<Cycle> {
    let conn = match connections.get_mut(conn_id) {
        Some(conn) => conn,
        None => return Ok(Cycle::Continue),
    };

    // Readiness may be stale; only commit to a blocking cycle when bytes
    // are actually waiting.
    let mut probe = [0u8; 1];
    match conn.stream.peek(&mut probe) {
        Ok(0) => return Ok(Cycle::Closed),
        Ok(_) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Cycle::Continue),
        Err(e) => return Err(e),
    }

    conn.stream.set_nonblocking(false)?;
    let cycle = conn.session.serve_one(&mut conn.stream, &ctx.dispatcher);
    if cycle == Cycle::Closed {
        return Ok(cycle);
    }
    conn.stream.set_nonblocking(true)?;

    // Re-arm so input that arrived during the cycle is reported again.
    poll.registry().reregister(
        &mut SourceFd(&conn.stream.as_raw_fd()),
        Token(conn_id),
        Interest::READABLE,
    )?;
    Ok(cycle)
}

fn close_connection(poll: &Poll, connections: &mut ConnectionRegistry, conn_id: usize) {
    if let Some(conn) = connections.remove(conn_id) {
        let _ = poll
            .registry()
            .deregister(&mut SourceFd(&conn.stream.as_raw_fd()));

        debug!(
            conn_id,
            client = conn.session.client_id(),
            solutions = conn.session.solution_num(),
            state = ?conn.session.state(),
            "Connection closed"
        );
    }
}
