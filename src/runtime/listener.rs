//! Listening socket setup.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

/// Pending connection queue length.
pub const LISTEN_BACKLOG: i32 = 16;

/// Resolve the configured listen address.
pub fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for '{addr}'"),
        )
    })
}

/// Create a bound, listening TCP socket.
///
/// `reuse_port` lets several listeners share the address so the kernel
/// balances connections across them.
pub fn create_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
