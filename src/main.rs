//! caret-echo: a single-threaded multiplexing TCP server
//!
//! Every accepted connection receives a `*` greeting. Afterwards, bytes
//! between `^` and `$` are echoed back incremented by one; everything else
//! is ignored.
//!
//! Features:
//! - One thread, many connections, driven by readiness notifications
//! - Backends: mio (epoll/kqueue) or poll(2)
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backend = ?config.backend,
        error_policy = ?config.error_policy,
        max_connections = config.max_connections,
        send_buffer_size = config.send_buffer_size,
        recv_buffer_size = config.recv_buffer_size,
        "Starting caret-echo server"
    );

    runtime::run(&config)?;
    Ok(())
}
