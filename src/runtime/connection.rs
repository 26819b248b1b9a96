//! Connection registry for the readiness-based event loops.
//!
//! Each open connection pairs its socket with the session that owns it.
//! The slab index doubles as the poll token.

use crate::session::Session;
use slab::Slab;
use std::net::TcpStream;

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub session: Session,
}

impl Connection {
    pub fn new(stream: TcpStream, session: Session) -> Self {
        Self { stream, session }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
