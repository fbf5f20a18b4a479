//! mio reactor implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread owns the `Poll`, the listener and every live connection, so
//! none of that state is shared. The only cross-thread touchpoint is the
//! [`StopHandle`]: an atomic flag plus a `mio::Waker` that interrupts the
//! readiness wait. Without the wake the loop still notices the flag within
//! one poll timeout.
//!
//! ## Interest registration
//!
//! A connection is always registered for read-interest. Write-interest is
//! added while its outbound buffer holds unflushed bytes and removed once the
//! buffer drains. Closing always deregisters before the socket is dropped.
//!
//! ## Read budget
//!
//! Readiness is edge-triggered, so a connection that still has unread input
//! after its per-event read budget gets no new event for it. Such connections
//! go on `ready_again` and are read again on the next turn, after that turn's
//! fresh events, with a zero wait timeout so nothing sleeps on them.

use crate::config::Config;
use crate::error::{BindError, ConnectionError, ServerError};
use crate::protocol::TimeProtocol;
use crate::runtime::connection::{Connection, Status};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Work derived from one readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// The listener has pending connections.
    Acceptable,
    /// A connection has bytes (or EOF, or an error) to read.
    Readable(usize),
    /// A connection can take more outbound bytes.
    Writable(usize),
    /// The stop handle interrupted the wait.
    Wake,
}

impl Dispatch {
    /// Map a readiness event to the handlers it triggers, reads first.
    fn from_event(event: &Event, out: &mut Vec<Dispatch>) {
        match event.token() {
            LISTENER_TOKEN => out.push(Dispatch::Acceptable),
            WAKER_TOKEN => out.push(Dispatch::Wake),
            Token(conn_id) => {
                // Hang-ups and socket errors surface through the next read
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    out.push(Dispatch::Readable(conn_id));
                }
                if event.is_writable() {
                    out.push(Dispatch::Writable(conn_id));
                }
            }
        }
    }
}

/// Thread-safe, idempotent shutdown trigger for a running [`Reactor`].
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    /// Request termination. Safe to call from any thread, any number of times.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.waker.wake() {
                // The flag alone still ends the loop after one poll timeout
                warn!(error = %e, "Failed to wake reactor");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A live connection plus the interest it is currently registered with.
struct LiveConnection {
    conn: Connection<TcpStream>,
    interest: Interest,
    /// Already on the ready-again queue.
    queued: bool,
}

impl LiveConnection {
    fn wanted_interest(&self) -> Interest {
        if self.conn.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }
}

/// Single-threaded, readiness-driven time server.
pub struct Reactor {
    poll: Poll,
    events: Events,
    dispatches: Vec<Dispatch>,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: Slab<LiveConnection>,
    max_connections: usize,
    protocol: TimeProtocol,
    scratch: Vec<u8>,
    greeting: Option<Vec<u8>>,
    max_pending_output: usize,
    /// Connections whose last read pass ended before `WouldBlock`; serviced
    /// after the next wait's events.
    ready_again: Vec<usize>,
    poll_timeout: Duration,
    /// Set when accept hit resource exhaustion; retried on every turn.
    accept_backlogged: bool,
    stop: StopHandle,
}

impl Reactor {
    /// Validate `config`, bind the listening endpoint and register it for
    /// accept-readiness.
    pub fn start(config: &Config) -> Result<Self, ServerError> {
        let protocol = TimeProtocol::new(
            config.framing,
            config.time_format.as_str(),
            config.max_request_size,
        )?;
        Self::start_with_protocol(config, protocol)
    }

    /// Like [`Reactor::start`], with a caller-supplied protocol instance.
    pub fn start_with_protocol(config: &Config, protocol: TimeProtocol) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = resolve_addr(&config.listen_addr())?;

        let poll = Poll::new().map_err(ServerError::Setup)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Setup)?;

        let listener = create_listener(addr, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::from_io(addr, e))?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Setup)?;

        info!(
            addr = %local_addr,
            backlog = config.backlog,
            framing = ?protocol.framing(),
            max_connections = config.max_connections,
            "The time server is listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            dispatches: Vec::with_capacity(config.events_capacity),
            listener,
            local_addr,
            connections: Slab::with_capacity(config.max_connections.min(1024)),
            max_connections: config.max_connections,
            protocol,
            scratch: vec![0u8; config.read_buffer_size],
            greeting: config.greeting.as_ref().map(|g| g.as_bytes().to_vec()),
            max_pending_output: config.max_pending_output,
            ready_again: Vec::new(),
            poll_timeout: config.poll_timeout,
            accept_backlogged: false,
            stop: StopHandle {
                stopped: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping the reactor from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request termination; equivalent to `stop_handle().stop()`.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drive the event loop on the calling thread until stopped.
    ///
    /// Returns after every connection and the listener have been closed.
    /// Per-connection failures never end the loop; only a failure of the
    /// readiness wait itself is returned.
    pub fn run(mut self) -> Result<(), ServerError> {
        let result = loop {
            if self.stop.is_stopped() {
                break Ok(());
            }
            if let Err(e) = self.turn() {
                error!(error = %e, "Reactor failed");
                break Err(e);
            }
        };

        self.shutdown();
        result
    }

    /// One readiness wait plus dispatch of everything it reported.
    fn turn(&mut self) -> Result<(), ServerError> {
        // Do not sleep while connections still have unread input
        let timeout = if self.ready_again.is_empty() {
            self.poll_timeout
        } else {
            Duration::ZERO
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(ServerError::Poll(e)),
        }

        if self.accept_backlogged {
            self.accept_backlogged = false;
            self.accept_connections();
        }

        if self.events.is_empty() && self.ready_again.is_empty() {
            trace!(connections = self.connections.len(), "Idle tick");
            return Ok(());
        }

        // Queued connections go after fresh events, each once per turn
        let mut dispatches = std::mem::take(&mut self.dispatches);
        for event in self.events.iter() {
            Dispatch::from_event(event, &mut dispatches);
        }
        for conn_id in self.ready_again.drain(..) {
            if let Some(live) = self.connections.get_mut(conn_id) {
                live.queued = false;
                dispatches.push(Dispatch::Readable(conn_id));
            }
        }
        for dispatch in dispatches.drain(..) {
            self.dispatch(dispatch);
        }
        self.dispatches = dispatches;

        Ok(())
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Acceptable => self.accept_connections(),
            Dispatch::Wake => trace!("Reactor woken"),
            Dispatch::Readable(conn_id) => {
                let result = match self.connections.get_mut(conn_id) {
                    Some(live) => live.conn.on_readable(&mut self.scratch, &self.protocol),
                    None => return,
                };
                self.after_io(conn_id, result);
            }
            Dispatch::Writable(conn_id) => {
                let result = match self.connections.get_mut(conn_id) {
                    Some(live) => live.conn.on_writable(),
                    None => return,
                };
                self.after_io(conn_id, result);
            }
        }
    }

    /// Apply the outcome of a handler: keep registration in sync or close.
    fn after_io(&mut self, conn_id: usize, result: Result<Status, ConnectionError>) {
        let outcome = result.and_then(|status| match status {
            Status::Open => self.sync_interest(conn_id).map(|_| Status::Open),
            Status::Closed => Ok(Status::Closed),
        });

        match outcome {
            Ok(Status::Open) => self.queue_if_unread(conn_id),
            Ok(Status::Closed) => {
                debug!(conn_id, "Peer closed connection");
                self.close_connection(conn_id);
            }
            Err(e) => {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id);
            }
        }
    }

    /// Put a connection that stopped reading early back on the queue.
    fn queue_if_unread(&mut self, conn_id: usize) {
        if let Some(live) = self.connections.get_mut(conn_id) {
            if !live.queued && live.conn.wants_read_again() {
                live.queued = true;
                self.ready_again.push(conn_id);
            }
        }
    }

    fn sync_interest(&mut self, conn_id: usize) -> Result<(), ConnectionError> {
        let Some(live) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        let wanted = live.wanted_interest();
        if wanted != live.interest {
            self.poll
                .registry()
                .reregister(live.conn.stream_mut(), Token(conn_id), wanted)
                .map_err(ConnectionError::Register)?;
            live.interest = wanted;
        }
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register_connection(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    // Typically EMFILE/ENFILE; the pending peer stays queued
                    error!(error = %e, "Accept error");
                    self.accept_backlogged = true;
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.connections.len() >= self.max_connections {
            warn!(peer = %peer, limit = self.max_connections, "Connection limit reached");
            return;
        }

        let entry = self.connections.vacant_entry();
        let conn_id = entry.key();

        let mut conn = Connection::new(stream, peer).with_output_limit(self.max_pending_output);
        if let Some(greeting) = &self.greeting {
            conn.enqueue(greeting);
        }

        let mut live = LiveConnection {
            conn,
            interest: Interest::READABLE,
            queued: false,
        };
        live.interest = live.wanted_interest();

        if let Err(e) =
            self.poll
                .registry()
                .register(live.conn.stream_mut(), Token(conn_id), live.interest)
        {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            return;
        }

        entry.insert(live);
        debug!(conn_id, peer = %peer, "Accepted connection");
    }

    /// Deregister then drop, so no closed descriptor stays registered.
    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut live) = self.connections.try_remove(conn_id) {
            live.conn.close();
            if let Err(e) = self.poll.registry().deregister(live.conn.stream_mut()) {
                debug!(conn_id, error = %e, "Deregister failed");
            }
            debug!(
                conn_id,
                peer = %live.conn.peer(),
                discarded = live.conn.pending_output().len(),
                "Connection closed"
            );
        }
    }

    /// Close every live connection, then the listener. Unflushed responses
    /// are discarded.
    fn shutdown(&mut self) {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        let closed = ids.len();
        for conn_id in ids {
            self.close_connection(conn_id);
        }

        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "Listener deregister failed");
        }

        info!(addr = %self.local_addr, closed, "The time server is stopped");
    }
}

fn resolve_addr(listen: &str) -> Result<SocketAddr, BindError> {
    listen
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| BindError::InvalidAddress(listen.to_string()))
}

/// Create a non-blocking TCP listener with the configured backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener, BindError> {
    let bind = || -> io::Result<std::net::TcpListener> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog.min(i32::MAX as u32) as i32)?;

        Ok(socket.into())
    };

    bind().map_err(|e| BindError::from_io(addr, e))
}
