//! Per-connection protocol state and the table of live connections.
//!
//! Connections are keyed by their socket descriptor. The OS hands the same
//! descriptor to a later connection once a socket is closed, so every
//! accepted socket starts from a freshly initialized [`Connection`] and the
//! registry replaces, never merges, whatever occupied the key before.

use crate::runtime::buffer::{BufferOverflow, SendBuffer};
use crate::runtime::interest::Interest;
use crate::runtime::protocol::{self, ProtocolState, GREETING};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// Identifier of a connection: its socket descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(RawFd);

impl ConnId {
    /// Identifier of the socket behind `source`.
    pub fn of<S: AsRawFd>(source: &S) -> Self {
        ConnId(source.as_raw_fd())
    }

    pub const fn from_raw(fd: RawFd) -> Self {
        ConnId(fd)
    }

    pub const fn raw(self) -> RawFd {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol state plus the outbound queue of one connection.
#[derive(Debug)]
pub struct Connection {
    state: ProtocolState,
    outbound: SendBuffer,
}

impl Connection {
    /// Create a connection with the greeting queued.
    pub fn new(send_buffer_size: usize) -> Self {
        let mut conn = Self {
            state: ProtocolState::GreetingPending,
            outbound: SendBuffer::new(send_buffer_size),
        };
        conn.reset();
        conn
    }

    /// Return to the just-accepted state: greeting queued, nothing else.
    pub fn reset(&mut self) {
        self.state = ProtocolState::GreetingPending;
        self.outbound.clear();
        let queued = self.outbound.push(GREETING);
        debug_assert!(queued.is_ok(), "send buffer cannot hold the greeting");
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn outbound(&self) -> &SendBuffer {
        &self.outbound
    }

    pub fn is_greeting_pending(&self) -> bool {
        self.state == ProtocolState::GreetingPending
    }

    /// Feed received bytes through the protocol, returning how many bytes
    /// were queued for sending.
    pub fn ingest(&mut self, input: &[u8]) -> Result<usize, BufferOverflow> {
        protocol::process_chunk(&mut self.state, input, &mut self.outbound)
    }

    /// Record that `n` pending bytes were sent.
    ///
    /// Returns `true` once the queue is empty. The first full flush also
    /// completes the greeting.
    pub fn mark_sent(&mut self, n: usize) -> bool {
        let drained = self.outbound.consume(n);
        if drained && self.state == ProtocolState::GreetingPending {
            self.state = ProtocolState::AwaitingMessageStart;
        }
        drained
    }
}

/// A registered connection: socket, protocol state and current registration.
#[derive(Debug)]
pub struct Slot<S> {
    pub stream: S,
    pub conn: Connection,
    /// Interest currently registered with the backend.
    pub interest: Interest,
    pub peer: SocketAddr,
}

/// Table of live connections keyed by [`ConnId`].
pub struct ConnectionRegistry<S> {
    slots: HashMap<ConnId, Slot<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a registry holding at most `max_connections` entries.
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: HashMap::new(),
            max_connections,
        }
    }

    /// Insert a slot, removing any previous occupant of `id` first.
    ///
    /// Returns the removed occupant.
    pub fn insert(&mut self, id: ConnId, slot: Slot<S>) -> Option<Slot<S>> {
        let previous = self.slots.remove(&id);
        self.slots.insert(id, slot);
        previous
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Slot<S>> {
        self.slots.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Slot<S>> {
        self.slots.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether another connection would exceed the limit.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.max_connections
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(conn: Connection) -> Slot<()> {
        Slot {
            stream: (),
            conn,
            interest: Interest::WriteOnly,
            peer: "127.0.0.1:1".parse().unwrap(),
        }
    }

    #[test]
    fn test_new_connection_queues_greeting() {
        let conn = Connection::new(16);
        assert!(conn.is_greeting_pending());
        assert_eq!(conn.outbound().pending(), &[GREETING]);
        assert_eq!(conn.outbound().write_cursor(), 0);
        assert_eq!(conn.outbound().read_end(), 1);
    }

    #[test]
    fn test_greeting_completes_on_full_flush() {
        let mut conn = Connection::new(16);
        assert!(conn.mark_sent(1));
        assert_eq!(conn.state(), ProtocolState::AwaitingMessageStart);
        assert!(!conn.outbound().has_pending());
    }

    #[test]
    fn test_reset_discards_previous_state() {
        let mut conn = Connection::new(16);
        conn.mark_sent(1);
        conn.ingest(b"^secret").unwrap();
        assert_eq!(conn.state(), ProtocolState::InMessage);

        conn.reset();
        assert!(conn.is_greeting_pending());
        assert_eq!(conn.outbound().pending(), &[GREETING]);
    }

    #[test]
    fn test_registry_replaces_reused_id() {
        let mut registry = ConnectionRegistry::new(4);
        let id = ConnId::from_raw(7);

        let mut stale = Connection::new(16);
        stale.mark_sent(1);
        stale.ingest(b"^leftover").unwrap();
        assert!(registry.insert(id, slot(stale)).is_none());

        let previous = registry.insert(id, slot(Connection::new(16)));
        assert_eq!(previous.unwrap().conn.state(), ProtocolState::InMessage);

        let current = registry.get_mut(id).unwrap();
        assert!(current.conn.is_greeting_pending());
        assert_eq!(current.conn.outbound().pending(), &[GREETING]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_limit() {
        let mut registry = ConnectionRegistry::new(2);
        registry.insert(ConnId::from_raw(3), slot(Connection::new(4)));
        assert!(!registry.is_full());
        registry.insert(ConnId::from_raw(4), slot(Connection::new(4)));
        assert!(registry.is_full());

        assert!(registry.remove(ConnId::from_raw(3)).is_some());
        assert!(registry.get_mut(ConnId::from_raw(3)).is_none());
        assert!(!registry.is_full());
        assert_eq!(registry.capacity(), 2);
    }
}
