//! mio backend.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! mio registrations are edge-triggered: a notification is delivered once
//! per readiness transition, and re-registering re-arms it.

use crate::runtime::backend::{self, Backend, Readiness, Source};
use crate::runtime::connection::ConnId;
use crate::runtime::interest::Interest;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(usize::MAX);

fn token(id: ConnId) -> Token {
    Token(id.raw() as usize)
}

fn mio_interest(interest: Interest) -> io::Result<mio::Interest> {
    match interest {
        Interest::None => Err(backend::no_interest()),
        Interest::ReadOnly => Ok(mio::Interest::READABLE),
        Interest::WriteOnly => Ok(mio::Interest::WRITABLE),
        Interest::Both => Ok(mio::Interest::READABLE | mio::Interest::WRITABLE),
    }
}

/// Backend over a mio `Poll`.
pub struct MioBackend {
    poll: Poll,
    events: Events,
    listener: TcpListener,
}

impl MioBackend {
    /// Watch `listener` with a fresh `Poll` reporting up to
    /// `events_capacity` sources per wait.
    pub fn new(listener: std::net::TcpListener, events_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, mio::Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity),
            listener,
        })
    }
}

impl Backend for MioBackend {
    type Stream = TcpStream;

    const EDGE_TRIGGERED: bool = true;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept()
    }

    fn register(&mut self, id: ConnId, stream: &mut TcpStream, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(stream, token(id), mio_interest(interest)?)
    }

    fn reregister(
        &mut self,
        id: ConnId,
        stream: &mut TcpStream,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(stream, token(id), mio_interest(interest)?)
    }

    fn deregister(&mut self, _id: ConnId, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(stream)
    }

    fn wait(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // A signal cut the wait short; report an empty batch
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let source = match event.token() {
                LISTENER_TOKEN => Source::Listener,
                Token(raw) => Source::Connection(ConnId::from_raw(raw as RawFd)),
            };
            let failed = event.is_error();
            events.push(Readiness {
                source,
                readable: event.is_readable() || event.is_read_closed() || failed,
                writable: event.is_writable() || event.is_write_closed() || failed,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Instant;

    fn new_backend() -> MioBackend {
        let listener = backend::bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        MioBackend::new(listener, 64).unwrap()
    }

    fn wait_for(backend: &mut MioBackend, want: Source) -> Readiness {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            backend
                .wait(&mut events, Some(Duration::from_millis(50)))
                .unwrap();
            if let Some(ready) = events.iter().find(|r| r.source == want) {
                return *ready;
            }
        }
        panic!("no readiness for {:?}", want);
    }

    #[test]
    fn test_listener_and_connection_readiness() {
        let mut backend = new_backend();
        let addr = backend.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();

        wait_for(&mut backend, Source::Listener);
        let (mut stream, _peer) = backend.accept().unwrap();
        let id = ConnId::of(&stream);

        backend
            .register(id, &mut stream, Interest::WriteOnly)
            .unwrap();
        assert!(wait_for(&mut backend, Source::Connection(id)).writable);

        client.write_all(b"^a$").unwrap();
        backend
            .reregister(id, &mut stream, Interest::ReadOnly)
            .unwrap();
        assert!(wait_for(&mut backend, Source::Connection(id)).readable);

        backend.deregister(id, &mut stream).unwrap();
    }

    #[test]
    fn test_register_without_interest_is_rejected() {
        let mut backend = new_backend();
        let addr = backend.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        wait_for(&mut backend, Source::Listener);
        let (mut stream, _) = backend.accept().unwrap();
        let err = backend
            .register(ConnId::of(&stream), &mut stream, Interest::None)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
