//! time-reactor: a single-threaded, non-blocking TCP time server.
//!
//! Clients send `QUERY TIME ORDER` and receive the server's current
//! wall-clock time; anything else is answered with `BAD ORDER`.
//! All connections are served from one thread by a readiness-driven
//! event loop (epoll on Linux, kqueue on macOS).

pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;

pub use config::Config;
pub use error::{BindError, ServerError};
pub use runtime::{Reactor, StopHandle};
