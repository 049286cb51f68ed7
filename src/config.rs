//! Configuration module for the caret-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Readiness backend driving the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendType {
    /// mio: epoll on Linux, kqueue on macOS (edge-triggered)
    Mio,
    /// poll(2) (level-triggered)
    Poll,
}

/// What to do when a single connection hits an unexpected I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Close the failing connection and keep serving the others
    Isolate,
    /// Stop the server
    FailFast,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "caret-echo")]
#[command(version = "0.1.0")]
#[command(about = "Single-threaded multiplexing caret echo server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Readiness backend
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendType>,

    /// Maximum number of concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Handling of unexpected per-connection I/O errors
    #[arg(long, value_enum)]
    pub error_policy: Option<ErrorPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backend")]
    pub backend: BackendType,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_error_policy")]
    pub error_policy: ErrorPolicy,
    /// Readiness events fetched per wait (mio backend)
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backend: default_backend(),
            max_connections: default_max_connections(),
            error_policy: default_error_policy(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Per-connection buffer configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Outbound buffer capacity in bytes
    #[serde(default = "default_buffer_size")]
    pub send_buffer_size: usize,
    /// Bytes taken from a socket per receive
    #[serde(default = "default_buffer_size")]
    pub recv_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: default_buffer_size(),
            recv_buffer_size: default_buffer_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_backend() -> BackendType {
    BackendType::Mio
}

fn default_max_connections() -> usize {
    16 * 1024
}

fn default_error_policy() -> ErrorPolicy {
    ErrorPolicy::Isolate
}

fn default_events_capacity() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backend: BackendType,
    pub max_connections: usize,
    pub error_policy: ErrorPolicy,
    pub events_capacity: usize,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments against the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backend: cli.backend.unwrap_or(toml_config.server.backend),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            error_policy: cli.error_policy.unwrap_or(toml_config.server.error_policy),
            events_capacity: toml_config.server.events_capacity,
            send_buffer_size: toml_config.connection.send_buffer_size,
            recv_buffer_size: toml_config.connection.recv_buffer_size,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.send_buffer_size == 0 || self.recv_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer sizes must be non-zero".to_string(),
            ));
        }
        // One receive into an empty send buffer must never overflow it
        if self.recv_buffer_size > self.send_buffer_size {
            return Err(ConfigError::Invalid(format!(
                "recv_buffer_size ({}) exceeds send_buffer_size ({})",
                self.recv_buffer_size, self.send_buffer_size
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be non-zero".to_string(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let mut argv = vec!["caret-echo"];
        argv.extend_from_slice(args);
        Config::from_args(CliArgs::try_parse_from(argv).unwrap())
    }

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "caret-echo-{}-{}.toml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.backend, BackendType::Mio);
        assert_eq!(config.error_policy, ErrorPolicy::Isolate);
        assert_eq!(config.send_buffer_size, 1024);
        assert_eq!(config.recv_buffer_size, 1024);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_positional_port_and_flags() {
        let config = parse(&[
            "7000",
            "--backend",
            "poll",
            "--error-policy",
            "fail-fast",
            "-m",
            "10",
        ])
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.backend, BackendType::Poll);
        assert_eq!(config.error_policy, ErrorPolicy::FailFast);
        assert_eq!(config.max_connections, 10);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9191
            backend = "poll"
            error_policy = "fail-fast"
            max_connections = 64

            [connection]
            send_buffer_size = 4096
            recv_buffer_size = 2048

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9191);
        assert_eq!(config.server.backend, BackendType::Poll);
        assert_eq!(config.server.error_policy, ErrorPolicy::FailFast);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.events_capacity, 1024);
        assert_eq!(config.connection.send_buffer_size, 4096);
        assert_eq!(config.connection.recv_buffer_size, 2048);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = write_config(
            "override",
            r#"
            [server]
            port = 9191
            backend = "poll"

            [logging]
            level = "warn"
            "#,
        );

        let config = parse(&["8080", "--config", path.to_str().unwrap()]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.backend, BackendType::Poll);
        assert_eq!(config.log_level, "warn");

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_recv_larger_than_send_rejected() {
        let path = write_config(
            "buffers",
            r#"
            [connection]
            send_buffer_size = 512
            recv_buffer_size = 1024
            "#,
        );

        let err = parse(&["--config", path.to_str().unwrap()]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{}", err);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let err = parse(&["--config", "/nonexistent/caret-echo.toml"]).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }

    #[test]
    fn test_zero_connections_rejected() {
        let err = parse(&["-m", "0"]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
