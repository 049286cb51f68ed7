//! poll(2) backend.
//!
//! Level-triggered: a connection is reported on every wait for as long as
//! it stays ready. The descriptor array is rebuilt from the registration
//! table before each wait, so register/reregister/deregister are plain
//! table updates.

use crate::runtime::backend::{self, Backend, Readiness, Source};
use crate::runtime::connection::ConnId;
use crate::runtime::interest::Interest;
use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// Backend over `libc::poll`.
pub struct PollBackend {
    listener: TcpListener,
    registrations: BTreeMap<ConnId, Interest>,
    fds: Vec<libc::pollfd>,
}

impl PollBackend {
    /// Watch `listener`, which must already be non-blocking.
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registrations: BTreeMap::new(),
            fds: Vec::new(),
        }
    }

    fn poll_events(interest: Interest) -> libc::c_short {
        let mut events = 0;
        if interest.is_readable() {
            events |= libc::POLLIN;
        }
        if interest.is_writable() {
            events |= libc::POLLOUT;
        }
        events
    }
}

impl Backend for PollBackend {
    type Stream = TcpStream;

    const EDGE_TRIGGERED: bool = false;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_nonblocking(true)?;
        Ok((stream, peer))
    }

    fn register(&mut self, id: ConnId, _stream: &mut TcpStream, interest: Interest) -> io::Result<()> {
        if interest.is_none() {
            return Err(backend::no_interest());
        }
        if self.registrations.contains_key(&id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("connection {} already registered", id),
            ));
        }
        self.registrations.insert(id, interest);
        Ok(())
    }

    fn reregister(
        &mut self,
        id: ConnId,
        _stream: &mut TcpStream,
        interest: Interest,
    ) -> io::Result<()> {
        if interest.is_none() {
            return Err(backend::no_interest());
        }
        match self.registrations.get_mut(&id) {
            Some(current) => {
                *current = interest;
                Ok(())
            }
            None => Err(not_registered(id)),
        }
    }

    fn deregister(&mut self, id: ConnId, _stream: &mut TcpStream) -> io::Result<()> {
        self.registrations
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_registered(id))
    }

    fn wait(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        self.fds.clear();
        self.fds.push(libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for (&id, &interest) in &self.registrations {
            self.fds.push(libc::pollfd {
                fd: id.raw(),
                events: Self::poll_events(interest),
                revents: 0,
            });
        }

        let timeout_ms = timeout
            .map(|t| t.as_millis().min(i32::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        // SAFETY: `fds` is a valid, exclusively borrowed array of `fds.len()` pollfds.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        let failed_mask = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
        for (i, pfd) in self.fds.iter().enumerate() {
            let re = pfd.revents;
            if re == 0 {
                continue;
            }
            let failed = re & failed_mask != 0;
            let source = if i == 0 {
                Source::Listener
            } else {
                Source::Connection(ConnId::from_raw(pfd.fd))
            };
            events.push(Readiness {
                source,
                readable: re & libc::POLLIN != 0 || failed,
                writable: re & libc::POLLOUT != 0 || failed,
            });
        }

        Ok(())
    }
}

fn not_registered(id: ConnId) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("connection {} not registered", id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn new_backend() -> PollBackend {
        let listener = backend::bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        PollBackend::new(listener)
    }

    fn wait_once(backend: &mut PollBackend) -> Vec<Readiness> {
        let mut events = Vec::new();
        backend
            .wait(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        events
    }

    #[test]
    fn test_level_triggered_reporting() {
        let mut backend = new_backend();
        let addr = backend.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();

        let events = wait_once(&mut backend);
        assert_eq!(events[0].source, Source::Listener);

        let (mut stream, _) = backend.accept().unwrap();
        let id = ConnId::of(&stream);
        backend.register(id, &mut stream, Interest::ReadOnly).unwrap();

        client.write_all(b"^a$").unwrap();

        // Unread data is reported again on the next wait
        for _ in 0..2 {
            let events = wait_once(&mut backend);
            let ready = events
                .iter()
                .find(|r| r.source == Source::Connection(id))
                .unwrap();
            assert!(ready.readable);
            assert!(!ready.writable);
        }

        backend.deregister(id, &mut stream).unwrap();
        assert!(backend.registrations.is_empty());
    }

    #[test]
    fn test_registration_bookkeeping() {
        let mut backend = new_backend();
        let addr = backend.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();

        wait_once(&mut backend);
        let (mut stream, _) = backend.accept().unwrap();
        let id = ConnId::of(&stream);

        let err = backend
            .reregister(id, &mut stream, Interest::ReadOnly)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        backend.register(id, &mut stream, Interest::WriteOnly).unwrap();
        let err = backend
            .register(id, &mut stream, Interest::WriteOnly)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        backend.reregister(id, &mut stream, Interest::Both).unwrap();
        assert_eq!(backend.registrations[&id], Interest::Both);

        let err = backend
            .reregister(id, &mut stream, Interest::None)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
