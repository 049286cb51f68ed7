//! Readiness callbacks for a single connection.
//!
//! Each callback works on one [`Connection`] and its stream and returns the
//! [`Interest`] the connection wants next. They never touch the backend or
//! other connections; the event loop turns the returned interest into a
//! registration update or a close. Streams are plain `Read`/`Write`
//! implementors, so the callbacks run without sockets in tests.

use crate::runtime::buffer::BufferOverflow;
use crate::runtime::connection::{ConnId, Connection};
use crate::runtime::interest::Interest;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, info};

/// Failure of a single connection.
#[derive(Debug)]
pub enum ConnError {
    /// Receive or send failed with something other than would-block.
    Io(io::Error),
    /// The protocol tried to queue more bytes than the send buffer holds.
    Overflow(BufferOverflow),
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Io(e) => write!(f, "I/O error: {}", e),
            ConnError::Overflow(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Io(e) => Some(e),
            ConnError::Overflow(e) => Some(e),
        }
    }
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Io(e)
    }
}

impl From<BufferOverflow> for ConnError {
    fn from(e: BufferOverflow) -> Self {
        ConnError::Overflow(e)
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Initialize a newly accepted connection.
///
/// A new connection only wants to write until its greeting is out.
pub fn on_connected(conn: &mut Connection, id: ConnId, peer: &SocketAddr) -> Interest {
    conn.reset();
    info!(conn = %id, peer = %peer, "Peer connected");
    Interest::WriteOnly
}

/// Handle read readiness.
///
/// Nothing is received while the greeting or earlier output is still
/// queued; write readiness will drain it and re-enable reading. A single
/// receive of at most `scratch.len()` bytes is performed otherwise.
pub fn on_readable<S: Read>(
    conn: &mut Connection,
    stream: &mut S,
    scratch: &mut [u8],
) -> Result<Interest, ConnError> {
    if conn.is_greeting_pending() || conn.outbound().has_pending() {
        return Ok(Interest::WriteOnly);
    }

    let n = match stream.read(scratch) {
        // Orderly shutdown by the peer
        Ok(0) => return Ok(Interest::None),
        Ok(n) => n,
        Err(ref e) if is_retryable(e) => return Ok(Interest::ReadOnly),
        Err(e) => return Err(ConnError::Io(e)),
    };

    let emitted = conn.ingest(&scratch[..n])?;

    // Favor draining over further reading once there is output
    Ok(Interest::new(emitted == 0, emitted > 0))
}

/// Handle write readiness.
///
/// Sends the pending slice once. A partial send keeps the cursor where the
/// socket stopped so the next writable notification resumes there.
pub fn on_writable<S: Write>(conn: &mut Connection, stream: &mut S) -> Result<Interest, ConnError> {
    if !conn.outbound().has_pending() {
        return Ok(Interest::Both);
    }

    let n = match stream.write(conn.outbound().pending()) {
        Ok(0) => {
            return Err(ConnError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "write returned 0",
            )));
        }
        Ok(n) => n,
        Err(ref e) if is_retryable(e) => return Ok(Interest::WriteOnly),
        Err(e) => return Err(ConnError::Io(e)),
    };

    if conn.mark_sent(n) {
        Ok(Interest::ReadOnly)
    } else {
        debug!(
            sent = n,
            write_cursor = conn.outbound().write_cursor(),
            read_end = conn.outbound().read_end(),
            "Partial send"
        );
        Ok(Interest::WriteOnly)
    }
}
