//! Single-threaded event loop.
//!
//! Each turn blocks once in [`Backend::wait`], then for every ready source:
//! accepts pending connections on the listener, or runs the read callback
//! followed by the write callback for a connection. The interest returned
//! by a callback becomes the connection's new registration; no interest
//! means deregister, close and forget.

use crate::config::ErrorPolicy;
use crate::runtime::backend::{Backend, Readiness, Source};
use crate::runtime::connection::{ConnId, Connection, ConnectionRegistry, Slot};
use crate::runtime::handler::{self, ConnError};
use crate::runtime::interest::Interest;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest wait before retrying accept after it failed with connections
/// possibly still queued.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Tunables for an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Capacity of each connection's outbound buffer.
    pub send_buffer_size: usize,
    /// Maximum bytes taken from a socket per receive.
    pub recv_buffer_size: usize,
    /// Connections beyond this are dropped right after accept.
    pub max_connections: usize,
    pub error_policy: ErrorPolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            send_buffer_size: 1024,
            recv_buffer_size: 1024,
            max_connections: 16 * 1024,
            error_policy: ErrorPolicy::Isolate,
        }
    }
}

/// Errors that end the event loop.
#[derive(Debug)]
pub enum ReactorError {
    /// Registering, updating or removing interest failed.
    Registration(io::Error),
    /// Waiting for readiness failed.
    Wait(io::Error),
    /// Accepting failed with something other than would-block (fail-fast only).
    Accept(io::Error),
    /// A connection failed (fail-fast only).
    Connection { id: ConnId, source: io::Error },
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorError::Registration(e) => write!(f, "registration failed: {}", e),
            ReactorError::Wait(e) => write!(f, "readiness wait failed: {}", e),
            ReactorError::Accept(e) => write!(f, "accept failed: {}", e),
            ReactorError::Connection { id, source } => {
                write!(f, "connection {} failed: {}", id, source)
            }
        }
    }
}

impl std::error::Error for ReactorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReactorError::Registration(e) | ReactorError::Wait(e) | ReactorError::Accept(e) => {
                Some(e)
            }
            ReactorError::Connection { source, .. } => Some(source),
        }
    }
}

/// Event loop over a readiness backend.
pub struct EventLoop<B: Backend> {
    backend: B,
    connections: ConnectionRegistry<B::Stream>,
    events: Vec<Readiness>,
    /// Receive buffer shared by all connections.
    scratch: Vec<u8>,
    settings: LoopSettings,
    /// An accept drain stopped early. Edge-triggered listeners will not be
    /// reported again for what is still queued, so the loop retries itself.
    accept_retry: bool,
}

impl<B: Backend> EventLoop<B> {
    pub fn new(backend: B, settings: LoopSettings) -> Self {
        // A zero-byte receive reads as end of stream and an empty send
        // buffer cannot hold the greeting
        assert!(
            settings.send_buffer_size > 0 && settings.recv_buffer_size > 0,
            "buffer sizes must be non-zero"
        );
        Self {
            backend,
            connections: ConnectionRegistry::new(settings.max_connections),
            events: Vec::new(),
            scratch: vec![0u8; settings.recv_buffer_size],
            settings,
            accept_retry: false,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.backend.local_addr()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until a fatal error.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        loop {
            self.turn(None)?;
        }
    }

    /// Wait for one readiness batch and dispatch it.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<(), ReactorError> {
        let mut events = std::mem::take(&mut self.events);
        let result = self.dispatch_batch(&mut events, timeout);
        self.events = events;
        result
    }

    fn dispatch_batch(
        &mut self,
        events: &mut Vec<Readiness>,
        timeout: Option<Duration>,
    ) -> Result<(), ReactorError> {
        let timeout = if self.accept_retry {
            Some(timeout.map_or(ACCEPT_RETRY_DELAY, |t| t.min(ACCEPT_RETRY_DELAY)))
        } else {
            timeout
        };
        self.backend
            .wait(events, timeout)
            .map_err(ReactorError::Wait)?;

        if self.accept_retry && !events.iter().any(|e| e.source == Source::Listener) {
            self.accept_connections()?;
        }

        for ready in events.iter() {
            match ready.source {
                Source::Listener => self.accept_connections()?,
                Source::Connection(id) => {
                    self.handle_connection_event(id, ready.readable, ready.writable)?
                }
            }
        }
        Ok(())
    }

    fn accept_connections(&mut self) -> Result<(), ReactorError> {
        self.accept_retry = false;
        loop {
            match self.backend.accept() {
                Ok((mut stream, peer)) => {
                    if self.connections.is_full() {
                        warn!(
                            peer = %peer,
                            limit = self.connections.capacity(),
                            "Connection limit reached, dropping connection"
                        );
                        continue;
                    }

                    let id = ConnId::of(&stream);
                    let mut conn = Connection::new(self.settings.send_buffer_size);
                    let interest = handler::on_connected(&mut conn, id, &peer);

                    self.backend
                        .register(id, &mut stream, interest)
                        .map_err(ReactorError::Registration)?;

                    let stale = self.connections.insert(
                        id,
                        Slot {
                            stream,
                            conn,
                            interest,
                            peer,
                        },
                    );
                    // A live stream owns its descriptor, so the key is vacant
                    debug_assert!(stale.is_none(), "connection {} still registered", id);
                    debug!(conn = %id, open = self.connection_count(), "Connection registered");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Peer reset while queued; only that connection is lost
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!(error = %e, "Connection aborted before accept");
                    continue;
                }
                Err(e) => match self.settings.error_policy {
                    ErrorPolicy::FailFast => return Err(ReactorError::Accept(e)),
                    ErrorPolicy::Isolate => {
                        error!(
                            error = %e,
                            retry_in = ?ACCEPT_RETRY_DELAY,
                            "Accept error, retrying later"
                        );
                        self.accept_retry = true;
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Run the callbacks for one ready connection: read first, then write.
    fn handle_connection_event(
        &mut self,
        id: ConnId,
        readable: bool,
        writable: bool,
    ) -> Result<(), ReactorError> {
        // Closed earlier in this batch
        let Some(slot) = self.connections.get_mut(id) else {
            return Ok(());
        };

        if readable && slot.interest.is_readable() {
            let result = handler::on_readable(&mut slot.conn, &mut slot.stream, &mut self.scratch);
            if !self.apply(id, result)? {
                return Ok(());
            }
        }

        if writable {
            let Some(slot) = self.connections.get_mut(id) else {
                return Ok(());
            };
            if slot.interest.is_writable() {
                let result = handler::on_writable(&mut slot.conn, &mut slot.stream);
                self.apply(id, result)?;
            }
        }

        Ok(())
    }

    /// Turn a callback result into a registration update or a close.
    ///
    /// Returns whether the connection is still open.
    fn apply(&mut self, id: ConnId, result: Result<Interest, ConnError>) -> Result<bool, ReactorError> {
        let interest = match result {
            Ok(interest) => interest,
            Err(ConnError::Overflow(e)) => {
                // A receive only happens into an empty send buffer, so only
                // settings with recv_buffer_size > send_buffer_size overflow
                debug_assert!(
                    self.settings.recv_buffer_size > self.settings.send_buffer_size,
                    "send buffer overflow with recv_buffer_size <= send_buffer_size"
                );
                error!(conn = %id, error = %e, "Send buffer overflow, closing connection");
                Interest::None
            }
            Err(ConnError::Io(e)) => match self.settings.error_policy {
                ErrorPolicy::FailFast => {
                    self.close(id)?;
                    return Err(ReactorError::Connection { id, source: e });
                }
                ErrorPolicy::Isolate => {
                    warn!(conn = %id, error = %e, "Connection error, closing connection");
                    Interest::None
                }
            },
        };

        if interest.is_none() {
            self.close(id)?;
            return Ok(false);
        }

        let Some(slot) = self.connections.get_mut(id) else {
            return Ok(false);
        };
        // Edge-triggered backends must be re-armed even when nothing changed
        if B::EDGE_TRIGGERED || interest != slot.interest {
            self.backend
                .reregister(id, &mut slot.stream, interest)
                .map_err(ReactorError::Registration)?;
            debug!(conn = %id, from = ?slot.interest, to = ?interest, "Interest updated");
            slot.interest = interest;
        }
        Ok(true)
    }

    fn close(&mut self, id: ConnId) -> Result<(), ReactorError> {
        if let Some(mut slot) = self.connections.remove(id) {
            self.backend
                .deregister(id, &mut slot.stream)
                .map_err(ReactorError::Registration)?;
            info!(
                conn = %id,
                peer = %slot.peer,
                state = ?slot.conn.state(),
                "Connection closed"
            );
            // Dropping the slot closes the socket
        }
        Ok(())
    }
}
