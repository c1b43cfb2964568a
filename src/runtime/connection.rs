//! Per-connection state.
//!
//! Each connection owns its stream, the partially read frame, and the FIFO
//! queue of responses waiting to be written. Responses leave the queue in
//! the order their requests arrived.

use crate::runtime::exchange::Exchange;
use crate::runtime::frame::FrameDecoder;
use mio::Interest;
use slab::Slab;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    /// The client socket.
    pub stream: S,
    /// Remote address, for logging.
    pub peer: SocketAddr,
    /// Frame being read.
    pub decoder: FrameDecoder,
    /// Responses waiting to be written, oldest first.
    pub outbound: VecDeque<Exchange>,
    /// Interest currently registered with the poller.
    pub interest: Option<Interest>,
    /// Reading is suspended until the outbound queue drains.
    pub read_paused: bool,
    /// Peer shut down its write side; close once the queue is flushed.
    pub read_closed: bool,
    /// Last time any byte moved in either direction.
    pub last_activity: Instant,
}

impl<S> Connection<S> {
    /// Create a connection with an empty queue, not yet registered.
    pub fn new(stream: S, peer: SocketAddr, max_frame_size: u32) -> Self {
        Self {
            stream,
            peer,
            decoder: FrameDecoder::new(max_frame_size),
            outbound: VecDeque::new(),
            interest: None,
            read_paused: false,
            read_closed: false,
            last_activity: Instant::now(),
        }
    }

    /// Interest the poller should hold for this connection.
    ///
    /// Readable unless reading is paused or the peer closed its write side;
    /// writable while responses are queued. Returns `None` only if neither
    /// applies.
    pub fn desired_interest(&self) -> Option<Interest> {
        let read = self.wants_read().then_some(Interest::READABLE);
        let write = (!self.outbound.is_empty()).then_some(Interest::WRITABLE);
        match (read, write) {
            (Some(r), Some(w)) => Some(r | w),
            (r, w) => r.or(w),
        }
    }

    /// True if the read handler should run on read readiness.
    pub fn wants_read(&self) -> bool {
        !self.read_paused && !self.read_closed
    }

    /// Number of queued responses.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Record that bytes moved.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// True if nothing has moved for longer than `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// Registry of active connections using slab allocation.
///
/// Slab keys double as poll tokens.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// True if another connection would exceed the limit.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Ids of connections idle for longer than `timeout`.
    pub fn idle_ids(&self, now: Instant, timeout: Duration) -> Vec<usize> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.is_idle(now, timeout))
            .map(|(id, _)| id)
            .collect()
    }
}
