//! Connection state machine for a single client.
//!
//! Each connection tracks its state (reading, writing, closing) together with
//! a pending inbound accumulator and a pending outbound buffer. Nothing here
//! knows about the readiness mechanism: the reactor calls `on_readable` /
//! `on_writable` and then asks the connection which interests it needs.
//!
//! A single readable event performs at most [`MAX_READS_PER_EVENT`] reads,
//! and reading pauses while unflushed output is above the connection's
//! limit. In both cases `wants_read_again` tells the reactor to come back
//! without waiting for a new readiness edge.

use crate::error::ConnectionError;
use crate::protocol::{Inbound, TimeProtocol};
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::trace;

/// Reads performed per readable event before yielding to other connections.
pub const MAX_READS_PER_EVENT: usize = 16;

/// Default limit on unflushed output before reading pauses.
pub const DEFAULT_MAX_PENDING_OUTPUT: usize = 64 * 1024;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next request.
    Reading,
    /// Outbound bytes are waiting to be flushed.
    Writing,
    /// Peer went away or an I/O error occurred; the reactor must close it.
    Closing,
}

/// Whether the connection survived a readiness callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Open,
    Closed,
}

/// A single client connection over a non-blocking stream.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    inbound: Inbound,
    outbound: BytesMut,
    max_pending_output: usize,
    /// The last read pass stopped before the socket reported `WouldBlock`.
    read_pending: bool,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in the initial reading state.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            inbound: Inbound::new(),
            outbound: BytesMut::new(),
            max_pending_output: DEFAULT_MAX_PENDING_OUTPUT,
            read_pending: false,
        }
    }

    /// Pause reading once this many response bytes are waiting to be sent.
    pub fn with_output_limit(mut self, max_pending_output: usize) -> Self {
        self.max_pending_output = max_pending_output.max(1);
        self
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Unflushed response bytes.
    pub(crate) fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    /// True while the outbound buffer still holds bytes, i.e. write-interest
    /// must stay registered.
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// True when unread input may remain and reading is not paused, so the
    /// reactor must call `on_readable` again without a new readiness event.
    pub fn wants_read_again(&self) -> bool {
        self.read_pending && !self.output_full() && self.state != ConnState::Closing
    }

    /// Queue raw bytes for sending and transition to writing.
    pub fn enqueue(&mut self, bytes: &[u8]) {
        if bytes.is_empty() || self.state == ConnState::Closing {
            return;
        }
        self.outbound.extend_from_slice(bytes);
        self.state = ConnState::Writing;
    }

    /// Read what the socket has to offer, within this event's budget.
    ///
    /// Every read is decoded into zero or more requests by `protocol` and the
    /// responses are appended to the outbound buffer. Reading stops at
    /// `WouldBlock`, after [`MAX_READS_PER_EVENT`] reads, or once pending
    /// output reaches the limit; `scratch` bounds a single read.
    pub fn on_readable(
        &mut self,
        scratch: &mut [u8],
        protocol: &TimeProtocol,
    ) -> Result<Status, ConnectionError> {
        if self.state == ConnState::Closing {
            return Ok(Status::Closed);
        }

        let mut reads = 0;
        while reads < MAX_READS_PER_EVENT {
            if self.output_full() {
                self.read_pending = true;
                return Ok(Status::Open);
            }

            match self.stream.read(scratch) {
                Ok(0) => {
                    // Orderly shutdown by the peer
                    self.state = ConnState::Closing;
                    return Ok(Status::Closed);
                }
                Ok(n) => {
                    reads += 1;
                    self.inbound.extend_from_slice(&scratch[..n]);
                    self.process_requests(protocol);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_pending = false;
                    return Ok(Status::Open);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = ConnState::Closing;
                    return Err(ConnectionError::Read(e));
                }
            }
        }

        self.read_pending = true;
        Ok(Status::Open)
    }

    /// Flush as much of the outbound buffer as the transport accepts.
    ///
    /// A partial write leaves the remainder at the front of the buffer for
    /// the next write-ready event. Once the buffer is empty the connection
    /// is back to reading.
    pub fn on_writable(&mut self) -> Result<Status, ConnectionError> {
        if self.state == ConnState::Closing {
            return Ok(Status::Closed);
        }

        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    self.state = ConnState::Closing;
                    return Err(ConnectionError::Write(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(n) => {
                    self.outbound.advance(n);
                    trace!(peer = %self.peer, written = n, remaining = self.outbound.len(), "Flushed");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Status::Open),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = ConnState::Closing;
                    return Err(ConnectionError::Write(e));
                }
            }
        }

        self.state = ConnState::Reading;
        Ok(Status::Open)
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }

    fn output_full(&self) -> bool {
        self.outbound.len() >= self.max_pending_output
    }

    fn process_requests(&mut self, protocol: &TimeProtocol) {
        while let Some(request) = protocol.next_request(&mut self.inbound) {
            let command = protocol.respond(&request, &mut self.outbound);
            trace!(peer = %self.peer, ?command, len = request.len(), "Request");
            self.state = ConnState::Writing;
        }
    }
}
