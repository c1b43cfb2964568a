//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on one thread. Connection state is only touched from the
//! loop; the [`ShutdownHandle`] is the one object shared across threads.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::handler::{on_readable, on_writable, ConnError, ReadOutcome, WriteOutcome};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// How often idle connections are swept when a timeout is configured.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Limits applied by the loop, resolved from [`Config`].
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_connections: usize,
    max_frame_size: u32,
    max_queue_depth: usize,
    event_capacity: usize,
    nodelay: bool,
    idle_timeout: Option<Duration>,
}

impl Limits {
    fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.max_connections,
            max_frame_size: config.max_frame_size,
            max_queue_depth: config.max_queue_depth,
            event_capacity: config.event_capacity,
            nodelay: config.nodelay,
            idle_timeout: (config.idle_timeout > 0)
                .then(|| Duration::from_secs(config.idle_timeout)),
        }
    }
}

/// Stops a running [`Server`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Ask the loop to exit after the current batch of events.
    pub fn shutdown(&self) -> io::Result<()> {
        self.stop.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// A bound, not yet running server.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    limits: Limits,
}

impl Server {
    /// Bind the listening socket and set up the poller.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = config.listen.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address for {}", config.listen),
            )
        })?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listener = TcpListener::from_std(create_listener(addr, config.backlog)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            poll,
            listener,
            local_addr,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            limits: Limits::from_config(config),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
            stop: Arc::clone(&self.stop),
        }
    }

    /// Run the loop until shut down, dispatching every request to `dispatcher`.
    ///
    /// Only poller failures end the loop with an error; socket errors close
    /// the affected connection and nothing else.
    pub fn run<D: Dispatcher + ?Sized>(mut self, dispatcher: &D) -> io::Result<()> {
        let limits = self.limits;
        let mut events = Events::with_capacity(limits.event_capacity);
        let mut connections: ConnectionRegistry<TcpStream> =
            ConnectionRegistry::new(limits.max_connections);
        let mut next_sweep = Instant::now() + SWEEP_INTERVAL;

        info!(
            addr = %self.local_addr,
            max_frame_size = limits.max_frame_size,
            max_queue_depth = limits.max_queue_depth,
            max_connections = limits.max_connections,
            idle_timeout = ?limits.idle_timeout,
            "Server listening"
        );

        loop {
            let timeout = limits
                .idle_timeout
                .map(|_| next_sweep.saturating_duration_since(Instant::now()));

            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => accept_connections(
                        &self.listener,
                        self.poll.registry(),
                        &mut connections,
                        &limits,
                    ),
                    WAKER_TOKEN => {}
                    Token(conn_id) => {
                        if let Err(e) = handle_connection_event(
                            conn_id,
                            event,
                            self.poll.registry(),
                            &mut connections,
                            dispatcher,
                            &limits,
                        ) {
                            close_connection(self.poll.registry(), &mut connections, conn_id, &e);
                        }
                    }
                }
            }

            if self.stop.load(Ordering::Acquire) {
                break;
            }

            if let Some(idle_timeout) = limits.idle_timeout {
                let now = Instant::now();
                if now >= next_sweep {
                    for conn_id in connections.idle_ids(now, idle_timeout) {
                        let reason = ConnError::IdleTimeout(idle_timeout);
                        close_connection(self.poll.registry(), &mut connections, conn_id, &reason);
                    }
                    next_sweep = now + SWEEP_INTERVAL;
                }
            }
        }

        info!(open_connections = connections.len(), "Server shutting down");
        Ok(())
    }
}

fn accept_connections(
    listener: &TcpListener,
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
    limits: &Limits,
) {
    // Readiness is edge-triggered: drain the backlog.
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if limits.nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                }

                // Rejected streams are dropped here, closing them.
                let Some(conn_id) =
                    connections.insert(Connection::new(stream, peer, limits.max_frame_size))
                else {
                    warn!(peer = %peer, "Connection limit reached, rejecting");
                    continue;
                };

                let Some(conn) = connections.get_mut(conn_id) else {
                    continue;
                };
                if let Err(e) = sync_interest(registry, conn_id, conn) {
                    warn!(peer = %peer, error = %e, "Failed to register connection");
                    connections.remove(conn_id);
                    continue;
                }

                debug!(conn_id, peer = %peer, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                break;
            }
        }
    }
}

fn handle_connection_event<D: Dispatcher + ?Sized>(
    conn_id: usize,
    event: &Event,
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
    dispatcher: &D,
    limits: &Limits,
) -> Result<(), ConnError> {
    let Some(conn) = connections.get_mut(conn_id) else {
        return Ok(());
    };

    if event.is_error() {
        if let Some(e) = conn.stream.take_error()? {
            return Err(e.into());
        }
    }

    if event.is_readable() && conn.wants_read() {
        read_pass(conn_id, conn, dispatcher, limits)?;
    }

    if event.is_writable() {
        match on_writable(conn)? {
            WriteOutcome::Drained { completed } => {
                trace!(conn_id, completed, "Write queue drained");
                if conn.read_closed {
                    return Err(ConnError::PeerDisconnect);
                }
            }
            WriteOutcome::Blocked { completed } => {
                trace!(conn_id, completed, queued = conn.queued(), "Write blocked");
            }
        }

        if conn.read_paused && !conn.read_closed && conn.queued() < limits.max_queue_depth {
            debug!(conn_id, queued = conn.queued(), "Resuming reads");
            conn.read_paused = false;
            // Bytes that arrived while paused produced no new edge.
            read_pass(conn_id, conn, dispatcher, limits)?;
        }
    }

    sync_interest(registry, conn_id, conn)?;
    Ok(())
}

fn read_pass<D: Dispatcher + ?Sized>(
    conn_id: usize,
    conn: &mut Connection<TcpStream>,
    dispatcher: &D,
    limits: &Limits,
) -> Result<(), ConnError> {
    let outcome = on_readable(conn, dispatcher, limits.max_queue_depth)?;
    match outcome {
        ReadOutcome::Paused { .. } => {
            debug!(conn_id, queued = conn.queued(), "Outbound queue full, pausing reads");
            conn.read_paused = true;
        }
        ReadOutcome::Closed { .. } => {
            debug!(conn_id, queued = conn.queued(), "Peer closed write side, flushing responses");
        }
        ReadOutcome::Drained { .. } => {}
    }
    if outcome.dispatched() > 0 {
        trace!(conn_id, dispatched = outcome.dispatched(), "Requests dispatched");
    }
    Ok(())
}

/// Bring the registered interest in line with what the connection needs.
///
/// Re-registers only when the interest actually changes, so arming write
/// interest that is already armed is a no-op.
fn sync_interest(
    registry: &Registry,
    conn_id: usize,
    conn: &mut Connection<TcpStream>,
) -> io::Result<()> {
    let desired = conn.desired_interest();
    if desired == conn.interest {
        return Ok(());
    }

    match (conn.interest, desired) {
        (None, Some(interest)) => {
            registry.register(&mut conn.stream, Token(conn_id), interest)?
        }
        (Some(_), Some(interest)) => {
            registry.reregister(&mut conn.stream, Token(conn_id), interest)?
        }
        (Some(_), None) => registry.deregister(&mut conn.stream)?,
        (None, None) => {}
    }

    conn.interest = desired;
    Ok(())
}

fn close_connection(
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
    conn_id: usize,
    reason: &ConnError,
) {
    let Some(mut conn) = connections.remove(conn_id) else {
        return;
    };

    if conn.interest.is_some() {
        let _ = registry.deregister(&mut conn.stream);
    }

    let dropped = conn.queued();
    match reason {
        ConnError::PeerDisconnect => {
            debug!(conn_id, peer = %conn.peer, dropped, "Client disconnected");
        }
        ConnError::IdleTimeout(_) => {
            info!(conn_id, peer = %conn.peer, error = %reason, "Closing idle connection");
        }
        _ => {
            warn!(conn_id, peer = %conn.peer, dropped, error = %reason, "Closing connection");
        }
    }
    // Dropping `conn` closes the socket and releases every queued exchange.
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
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
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}
