//! Single-threaded readiness-driven runtime.
//!
//! Layers, leaves first:
//! - `buffer`, `protocol`, `connection`: per-connection state and the caret
//!   echo state machine
//! - `handler`: readiness callbacks returning an `Interest`
//! - `backend`: the `Backend` trait with `mio` (edge-triggered) and
//!   `poll` (level-triggered) implementations
//! - `event_loop`: owns the connection table and drives the callbacks
//!
//! The protocol and callbacks are written once and shared by every backend.

mod backend;
mod buffer;
mod connection;
mod event_loop;
mod handler;
mod interest;
mod mio;
mod poll;
mod protocol;

use crate::config::{BackendType, Config};
use backend::{bind_listener, Backend};
use event_loop::{EventLoop, LoopSettings, ReactorError};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::info;

/// Errors from setting up or running the server.
#[derive(Debug)]
pub enum ServerError {
    /// Resolving or binding the listen address failed.
    Setup(io::Error),
    Reactor(ReactorError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Setup(e) => write!(f, "server setup failed: {}", e),
            ServerError::Reactor(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Setup(e) => Some(e),
            ServerError::Reactor(e) => Some(e),
        }
    }
}

impl From<ReactorError> for ServerError {
    fn from(e: ReactorError) -> Self {
        ServerError::Reactor(e)
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for {}:{}", host, port),
        )
    })
}

/// Bind the listener and serve on the configured backend until a fatal error.
pub fn run(config: &Config) -> Result<(), ServerError> {
    let addr = resolve(&config.host, config.port).map_err(ServerError::Setup)?;
    let listener = bind_listener(addr).map_err(ServerError::Setup)?;

    let settings = LoopSettings {
        send_buffer_size: config.send_buffer_size,
        recv_buffer_size: config.recv_buffer_size,
        max_connections: config.max_connections,
        error_policy: config.error_policy,
    };

    match config.backend {
        BackendType::Mio => {
            let backend =
                mio::MioBackend::new(listener, config.events_capacity).map_err(ServerError::Setup)?;
            serve(EventLoop::new(backend, settings), config.backend)
        }
        BackendType::Poll => serve(
            EventLoop::new(poll::PollBackend::new(listener), settings),
            config.backend,
        ),
    }
}

fn serve<B: Backend>(mut event_loop: EventLoop<B>, backend: BackendType) -> Result<(), ServerError> {
    let addr = event_loop.local_addr().map_err(ServerError::Setup)?;
    info!(addr = %addr, backend = ?backend, "Serving");
    event_loop.run()?;
    Ok(())
}
