//! Single-threaded readiness-based runtime.
//!
//! - `Connection`: per-client state machine and buffers
//! - `Reactor`: mio event loop owning the listener and every connection

mod connection;
mod reactor;

pub use connection::{
    ConnState, Connection, Status, DEFAULT_MAX_PENDING_OUTPUT, MAX_READS_PER_EVENT,
};
pub use reactor::{Reactor, StopHandle};
