//! Readiness-notification backends.
//!
//! The event loop only talks to the OS through [`Backend`]: accept a
//! connection, register/update/remove interest for a connection, and wait
//! for readiness. Protocol code never sees which facility is underneath.

use crate::runtime::connection::ConnId;
use crate::runtime::interest::Interest;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 64;

/// Where a readiness notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Listener,
    Connection(ConnId),
}

/// One entry of a readiness batch.
///
/// Errors and hang-ups are reported as both readable and writable so the
/// next receive or send surfaces them.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub source: Source,
    pub readable: bool,
    pub writable: bool,
}

/// A readiness-notification facility plus the listening socket it watches.
pub trait Backend {
    /// Non-blocking connection stream produced by `accept`.
    type Stream: Read + Write + AsRawFd;

    /// Whether notifications are consumed on delivery.
    ///
    /// Edge-triggered backends only report a transition once, so the event
    /// loop re-arms every connection after each callback.
    const EDGE_TRIGGERED: bool;

    /// Address of the listening socket.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Accept one pending connection.
    ///
    /// Returns `ErrorKind::WouldBlock` once the accept queue is empty.
    fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Start watching a connection. `interest` must not be `Interest::None`.
    fn register(&mut self, id: ConnId, stream: &mut Self::Stream, interest: Interest)
        -> io::Result<()>;

    /// Replace the interest of a watched connection.
    fn reregister(
        &mut self,
        id: ConnId,
        stream: &mut Self::Stream,
        interest: Interest,
    ) -> io::Result<()>;

    /// Stop watching a connection.
    fn deregister(&mut self, id: ConnId, stream: &mut Self::Stream) -> io::Result<()>;

    /// Block until at least one source is ready or `timeout` elapses,
    /// replacing the contents of `events` with the ready sources.
    fn wait(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;
}

pub(crate) fn no_interest() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "cannot register a connection with no interest",
    )
}

/// Create a non-blocking TCP listener bound to `addr`.
pub fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
