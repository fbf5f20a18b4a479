//! Configuration module for the time server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::protocol::{validate_time_format, Framing, DEFAULT_MAX_REQUEST_SIZE, DEFAULT_TIME_FORMAT};
use crate::runtime::DEFAULT_MAX_PENDING_OUTPUT;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments for the time server
#[derive(Parser, Debug, Default)]
#[command(name = "time-reactor")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded, readiness-driven TCP time server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum number of live connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Text sent to every client as soon as it connects
    #[arg(long)]
    pub greeting: Option<String>,

    /// Request framing
    #[arg(long, value_enum)]
    pub framing: Option<Framing>,

    /// strftime format for time responses
    #[arg(long)]
    pub time_format: Option<String>,

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
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TomlConfig {
    /// Read and parse a TOML configuration file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bound on queued-but-unaccepted connections
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum number of live connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness wait timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Bytes consumed per read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Readiness events collected per wait
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Unflushed response bytes per connection before reading pauses
    #[serde(default = "default_max_pending_output")]
    pub max_pending_output: usize,
    /// Optional greeting sent on accept
    pub greeting: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            poll_timeout_ms: default_poll_timeout_ms(),
            read_buffer_size: default_read_buffer_size(),
            events_capacity: default_events_capacity(),
            max_pending_output: default_max_pending_output(),
            greeting: None,
        }
    }
}

/// Protocol-related configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_time_format")]
    pub time_format: String,
    /// Largest unterminated request accepted in line mode
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            time_format: default_time_format(),
            max_request_size: default_max_request_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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
    8080
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_max_pending_output() -> usize {
    DEFAULT_MAX_PENDING_OUTPUT
}

fn default_time_format() -> String {
    DEFAULT_TIME_FORMAT.to_string()
}

fn default_max_request_size() -> usize {
    DEFAULT_MAX_REQUEST_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: usize,
    pub poll_timeout: Duration,
    pub read_buffer_size: usize,
    pub events_capacity: usize,
    pub max_pending_output: usize,
    pub greeting: Option<String>,
    pub framing: Framing,
    pub time_format: String,
    pub max_request_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = match cli.config {
            Some(ref config_path) => TomlConfig::from_path(config_path)?,
            None => TomlConfig::default(),
        };

        let config = Self::resolve(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            protocol,
            logging,
        } = toml_config;

        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            backlog: cli.backlog.unwrap_or(server.backlog),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            poll_timeout: Duration::from_millis(server.poll_timeout_ms),
            read_buffer_size: server.read_buffer_size,
            events_capacity: server.events_capacity,
            max_pending_output: server.max_pending_output,
            greeting: cli.greeting.or(server.greeting),
            framing: cli.framing.unwrap_or(protocol.framing),
            time_format: cli.time_format.unwrap_or(protocol.time_format),
            max_request_size: protocol.max_request_size,
            log_level: cli.log_level.unwrap_or(logging.level),
        }
    }

    /// Reject values the reactor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("server.backlog", self.backlog as usize),
            ("server.max_connections", self.max_connections),
            ("server.read_buffer_size", self.read_buffer_size),
            ("server.events_capacity", self.events_capacity),
            ("server.max_pending_output", self.max_pending_output),
            ("protocol.max_request_size", self.max_request_size),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "server.poll_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        validate_time_format(&self.time_format).map_err(|reason| ConfigError::Invalid {
            field: "protocol.time_format",
            reason,
        })
    }

    /// `host:port` string handed to the listener.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.backlog, 1024);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.max_pending_output, 64 * 1024);
        assert_eq!(config.framing, Framing::PerRead);
        assert_eq!(config.time_format, DEFAULT_TIME_FORMAT);
        assert!(config.greeting.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9090
            backlog = 128
            poll_timeout_ms = 250
            greeting = "Got you!"

            [protocol]
            framing = "line"
            time_format = "%H:%M:%S"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.poll_timeout_ms, 250);
        assert_eq!(config.server.read_buffer_size, 1024);
        assert_eq!(config.server.greeting.as_deref(), Some("Got you!"));
        assert_eq!(config.protocol.framing, Framing::Line);
        assert_eq!(config.protocol.time_format, "%H:%M:%S");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let result: Result<TomlConfig, _> = toml::from_str("[server]\nport = 70000\n");
        assert!(result.is_err());

        let result = CliArgs::try_parse_from(["time-reactor", "--port", "65536"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig =
            toml::from_str("[server]\nport = 9090\nhost = \"10.0.0.1\"\n[logging]\nlevel = \"warn\"\n")
                .unwrap();
        let cli = CliArgs::try_parse_from([
            "time-reactor",
            "--port",
            "7070",
            "--framing",
            "line",
            "--log-level",
            "trace",
        ])
        .unwrap();

        let config = Config::resolve(cli, file);
        assert_eq!(config.port, 7070);
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.framing, Framing::Line);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_validate_rejects_zero_and_bad_format() {
        let config = Config {
            read_buffer_size: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "server.read_buffer_size",
                ..
            })
        ));

        let config = Config {
            backlog: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "server.backlog",
                ..
            })
        ));

        let config = Config {
            max_pending_output: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "server.max_pending_output",
                ..
            })
        ));

        let config = Config {
            time_format: "%Q".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "protocol.time_format",
                ..
            })
        ));
    }

    #[test]
    fn test_listen_addr_brackets_ipv6() {
        let config = Config {
            host: "::1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.listen_addr(), "[::1]:8080");
        assert_eq!(Config::default().listen_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nmax_connections = 50").unwrap();

        let parsed = TomlConfig::from_path(file.path()).unwrap();
        assert_eq!(parsed.server.max_connections, 50);

        let missing = TomlConfig::from_path(Path::new("/nonexistent/time-reactor.toml"));
        assert!(matches!(missing, Err(ConfigError::FileRead(..))));
    }
}
