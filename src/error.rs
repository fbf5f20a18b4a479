//! Error types for the time server.
//!
//! Only [`BindError`] and [`ServerError`] ever reach the caller of the
//! reactor. [`ConnectionError`] stays inside the run loop: the affected
//! connection is closed and every other connection keeps being served.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to create the listening endpoint.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("address {0} is already in use")]
    AddrInUse(SocketAddr),

    #[error("permission denied binding {0}")]
    PermissionDenied(SocketAddr),

    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    pub(crate) fn from_io(addr: SocketAddr, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::AddrInUse => BindError::AddrInUse(addr),
            io::ErrorKind::PermissionDenied => BindError::PermissionDenied(addr),
            io::ErrorKind::AddrNotAvailable => BindError::InvalidAddress(addr.to_string()),
            _ => BindError::Io { addr, source },
        }
    }
}

/// Errors that terminate the reactor as a whole.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create readiness context: {0}")]
    Setup(#[source] io::Error),

    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),
}

/// Per-connection failure. The connection is closed; nothing else is affected.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("interest registration failed: {0}")]
    Register(#[source] io::Error),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}
