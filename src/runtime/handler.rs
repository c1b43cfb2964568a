//! Read and write handlers invoked on socket readiness.
//!
//! Both are generic over the stream so they can be driven by a scripted
//! stream in tests. Neither ever blocks: each returns as soon as the socket
//! reports `WouldBlock`, leaving enough state in the [`Connection`] to resume
//! on the next readiness event.

use crate::runtime::connection::Connection;
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::exchange::{Exchange, Request};
use crate::runtime::frame::FrameError;
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Malformed input from the peer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// Peer closed its side in the middle of a frame.
    #[error("connection closed mid-frame")]
    Truncated,
}

/// Errors that end a connection.
///
/// None of these affect other connections.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("peer disconnected")]
    PeerDisconnect,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("response body of {0} bytes does not fit a frame")]
    ResponseTooLarge(usize),
    #[error("no activity for {0:?}")]
    IdleTimeout(Duration),
}

impl From<FrameError> for ConnError {
    fn from(e: FrameError) -> Self {
        ConnError::Protocol(e.into())
    }
}

/// Outcome of a successful read pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Socket drained; `dispatched` requests were queued.
    Drained { dispatched: usize },
    /// Outbound queue is full; reading stops until it drains.
    Paused { dispatched: usize },
    /// Peer shut down its write side between frames with responses still
    /// queued; those are written before the connection closes.
    Closed { dispatched: usize },
}

impl ReadOutcome {
    /// Requests dispatched during the pass.
    pub fn dispatched(self) -> usize {
        match self {
            ReadOutcome::Drained { dispatched }
            | ReadOutcome::Paused { dispatched }
            | ReadOutcome::Closed { dispatched } => dispatched,
        }
    }
}

/// Outcome of a successful write pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Queue emptied; `completed` responses were fully written.
    Drained { completed: usize },
    /// Socket stopped accepting bytes with responses still queued.
    Blocked { completed: usize },
}

/// Handle read readiness.
///
/// Reads one frame part at a time into the connection's decoder, so bytes
/// of a following frame are never consumed before the current one is
/// dispatched. Each complete frame is parsed, dispatched and its response
/// queued. Stops at `WouldBlock` or once `max_queue_depth` responses are
/// queued.
///
/// End of stream between frames is a disconnect when nothing is queued.
/// Otherwise the connection is marked read-closed so the queued responses
/// still go out.
pub fn on_readable<S, D>(
    conn: &mut Connection<S>,
    dispatcher: &D,
    max_queue_depth: usize,
) -> Result<ReadOutcome, ConnError>
where
    S: Read,
    D: Dispatcher + ?Sized,
{
    let mut dispatched = 0;

    loop {
        if conn.outbound.len() >= max_queue_depth {
            return Ok(ReadOutcome::Paused { dispatched });
        }

        let n = match conn.stream.read(conn.decoder.spare()) {
            Ok(0) if conn.decoder.is_idle() => {
                if conn.outbound.is_empty() {
                    return Err(ConnError::PeerDisconnect);
                }
                conn.read_closed = true;
                return Ok(ReadOutcome::Closed { dispatched });
            }
            Ok(0) => return Err(ProtocolError::Truncated.into()),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ReadOutcome::Drained { dispatched });
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        conn.touch();

        let Some(body) = conn.decoder.advance(n)? else {
            continue;
        };

        let mut exchange = Exchange::new(Request::parse(body));
        if exchange.request().document().is_none() {
            debug!(peer = %conn.peer, "request body is not valid JSON");
        }

        let (request, response) = exchange.parts_mut();
        dispatcher.dispatch(request, response);
        exchange.seal().map_err(ConnError::ResponseTooLarge)?;
        trace!(
            body_len = exchange.response().body_len(),
            queued = conn.outbound.len() + 1,
            "response queued"
        );

        conn.outbound.push_back(exchange);
        dispatched += 1;
    }
}

/// Handle write readiness.
///
/// Writes queued responses in order, resuming the head response from its
/// cursor. Completed responses are dropped from the queue along with their
/// requests. Keeps going while the socket accepts bytes.
pub fn on_writable<S: Write>(conn: &mut Connection<S>) -> Result<WriteOutcome, ConnError> {
    let mut completed = 0;

    while let Some(exchange) = conn.outbound.front_mut() {
        if !exchange.is_flushed() {
            let n = match conn.stream.write_vectored(&exchange.pending_slices()) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome::Blocked { completed });
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            exchange.advance(n);
            let (written, total) = (exchange.written(), exchange.wire_len());
            conn.touch();

            if written < total {
                trace!(written, total, "partial write");
                continue;
            }
        }

        conn.outbound.pop_front();
        completed += 1;
    }

    Ok(WriteOutcome::Drained { completed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::exchange::Response;
    use crate::runtime::frame::{decode_header, encode_frame, encode_header, HEADER_LEN};
    use bytes::Bytes;
    use serde_json::{json, Value};
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::io::IoSlice;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted stream.
    ///
    /// Reads are served from `input` in the given chunks; `None` entries
    /// produce `WouldBlock`. Writes accept at most `write_limit` bytes per
    /// call and hit `WouldBlock` after `writes_before_block` calls.
    struct MockStream {
        input: VecDeque<Option<Vec<u8>>>,
        eof: bool,
        output: Vec<u8>,
        write_limit: usize,
        writes_before_block: usize,
        write_error: Option<io::ErrorKind>,
    }

    impl MockStream {
        fn new() -> Self {
            Self {
                input: VecDeque::new(),
                eof: false,
                output: Vec::new(),
                write_limit: usize::MAX,
                writes_before_block: usize::MAX,
                write_error: None,
            }
        }

        fn feed(&mut self, bytes: &[u8]) {
            self.input.push_back(Some(bytes.to_vec()));
        }

        fn feed_block(&mut self) {
            self.input.push_back(None);
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.input.pop_front() {
                Some(Some(mut chunk)) => {
                    let n = buf.len().min(chunk.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.input.push_front(Some(chunk.split_off(n)));
                    }
                    Ok(n)
                }
                Some(None) => Err(io::ErrorKind::WouldBlock.into()),
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            if self.writes_before_block == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.writes_before_block -= 1;
            let n = buf.len().min(self.write_limit);
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        // Gathers across slices like a socket would.
        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            if self.writes_before_block == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.writes_before_block -= 1;
            let mut budget = self.write_limit;
            let mut written = 0;
            for buf in bufs {
                let n = buf.len().min(budget);
                self.output.extend_from_slice(&buf[..n]);
                budget -= n;
                written += n;
                if budget == 0 {
                    break;
                }
            }
            Ok(written)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Echoes the request document back under "echo", counting calls.
    struct Echo {
        calls: Cell<usize>,
    }

    impl Echo {
        fn new() -> Self {
            Self {
                calls: Cell::new(0),
            }
        }
    }

    impl Dispatcher for Echo {
        fn dispatch(&self, request: &Request, response: &mut Response) {
            self.calls.set(self.calls.get() + 1);
            let echoed = request.document().cloned().unwrap_or(Value::Null);
            response.document_mut()["echo"] = echoed;
        }
    }

    fn conn(stream: MockStream) -> Connection<MockStream> {
        Connection::new(stream, "127.0.0.1:9000".parse().unwrap(), 1024)
    }

    /// Split written output back into frame bodies.
    fn frames(mut out: &[u8]) -> Vec<Value> {
        let mut bodies = Vec::new();
        while !out.is_empty() {
            let len = decode_header(out[..HEADER_LEN].try_into().unwrap()) as usize;
            let body = &out[HEADER_LEN..HEADER_LEN + len];
            bodies.push(serde_json::from_slice(body).unwrap());
            out = &out[HEADER_LEN + len..];
        }
        bodies
    }

    #[test]
    fn test_read_dispatches_complete_frame() {
        let mut stream = MockStream::new();
        stream.feed(&encode_frame(b"{}"));
        let mut conn = conn(stream);
        let echo = Echo::new();

        let outcome = on_readable(&mut conn, &echo, 16).unwrap();
        assert_eq!(outcome, ReadOutcome::Drained { dispatched: 1 });
        assert_eq!(echo.calls.get(), 1);
        assert_eq!(conn.queued(), 1);

        let response = conn.outbound[0].response();
        let body: Value = serde_json::from_slice(response.raw().unwrap()).unwrap();
        assert_eq!(body, json!({"echo": {}}));
    }

    #[test]
    fn test_read_resumes_partial_frame_across_events() {
        let wire = encode_frame(br#"{"n":1}"#);
        let mut stream = MockStream::new();
        stream.feed(&wire[..2]);
        stream.feed_block();
        stream.feed(&wire[2..6]);
        stream.feed_block();
        stream.feed(&wire[6..]);
        let mut conn = conn(stream);
        let echo = Echo::new();

        assert_eq!(
            on_readable(&mut conn, &echo, 16).unwrap(),
            ReadOutcome::Drained { dispatched: 0 }
        );
        assert_eq!(
            on_readable(&mut conn, &echo, 16).unwrap(),
            ReadOutcome::Drained { dispatched: 0 }
        );
        assert!(!conn.decoder.is_idle());
        assert_eq!(
            on_readable(&mut conn, &echo, 16).unwrap(),
            ReadOutcome::Drained { dispatched: 1 }
        );
        assert!(conn.decoder.is_idle());
        assert_eq!(echo.calls.get(), 1);
    }

    #[test]
    fn test_invalid_json_still_dispatched() {
        let mut stream = MockStream::new();
        stream.feed(&encode_frame(b"{oops"));
        let mut conn = conn(stream);
        let echo = Echo::new();

        on_readable(&mut conn, &echo, 16).unwrap();
        assert_eq!(echo.calls.get(), 1);
        assert!(conn.outbound[0].request().document().is_none());
    }

    #[test]
    fn test_oversized_header_never_dispatches() {
        let mut stream = MockStream::new();
        stream.feed(&[0xFF, 0xFF, 0xFF, 0xFF]);
        stream.feed(b"{}");
        let mut conn = conn(stream);
        let echo = Echo::new();

        let err = on_readable(&mut conn, &echo, 16).unwrap_err();
        assert!(matches!(
            err,
            ConnError::Protocol(ProtocolError::Frame(FrameError::TooLarge { .. }))
        ));
        assert_eq!(echo.calls.get(), 0);
        // Body bytes were left unread.
        assert_eq!(conn.stream.input.len(), 1);
    }

    #[test]
    fn test_immediate_eof_is_disconnect() {
        let mut stream = MockStream::new();
        stream.eof = true;
        let mut conn = conn(stream);
        let echo = Echo::new();

        let err = on_readable(&mut conn, &echo, 16).unwrap_err();
        assert!(matches!(err, ConnError::PeerDisconnect));
        assert_eq!(echo.calls.get(), 0);
    }

    #[test]
    fn test_eof_after_frame_keeps_queued_response() {
        let mut stream = MockStream::new();
        stream.feed(&encode_frame(b"{}"));
        stream.eof = true;
        let mut conn = conn(stream);
        let echo = Echo::new();

        assert_eq!(
            on_readable(&mut conn, &echo, 16).unwrap(),
            ReadOutcome::Closed { dispatched: 1 }
        );
        assert!(conn.read_closed);
        assert_eq!(conn.queued(), 1);

        assert_eq!(
            on_writable(&mut conn).unwrap(),
            WriteOutcome::Drained { completed: 1 }
        );
        assert_eq!(frames(&conn.stream.output), vec![json!({"echo": {}})]);
    }

    #[test]
    fn test_eof_mid_frame_is_truncation() {
        let mut stream = MockStream::new();
        stream.feed(&encode_header(10));
        stream.feed(b"{\"a\"");
        stream.eof = true;
        let mut conn = conn(stream);
        let echo = Echo::new();

        let err = on_readable(&mut conn, &echo, 16).unwrap_err();
        assert!(matches!(err, ConnError::Protocol(ProtocolError::Truncated)));
        assert_eq!(echo.calls.get(), 0);
    }

    #[test]
    fn test_backpressure_pauses_reading() {
        let mut stream = MockStream::new();
        for i in 0..5 {
            stream.feed(&encode_frame(format!("{{\"n\":{i}}}").as_bytes()));
        }
        let mut conn = conn(stream);
        let echo = Echo::new();

        assert_eq!(
            on_readable(&mut conn, &echo, 2).unwrap(),
            ReadOutcome::Paused { dispatched: 2 }
        );
        assert_eq!(conn.queued(), 2);

        on_writable(&mut conn).unwrap();
        assert_eq!(conn.queued(), 0);

        assert_eq!(
            on_readable(&mut conn, &echo, 2).unwrap(),
            ReadOutcome::Paused { dispatched: 2 }
        );
        on_writable(&mut conn).unwrap();
        assert_eq!(
            on_readable(&mut conn, &echo, 2).unwrap(),
            ReadOutcome::Drained { dispatched: 1 }
        );
        on_writable(&mut conn).unwrap();

        let ns: Vec<Value> = frames(&conn.stream.output)
            .into_iter()
            .map(|v| v["echo"]["n"].clone())
            .collect();
        assert_eq!(ns, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn test_write_empty_queue_is_noop() {
        let mut conn = conn(MockStream::new());
        assert_eq!(
            on_writable(&mut conn).unwrap(),
            WriteOutcome::Drained { completed: 0 }
        );
        assert!(conn.stream.output.is_empty());
    }

    #[test]
    fn test_partial_writes_deliver_exact_bytes() {
        let request = br#"{"payload":"abcdefghijklmnopqrstuvwxyz"}"#;

        let mut reference = conn(MockStream::new());
        reference.stream.feed(&encode_frame(request));
        on_readable(&mut reference, &Echo::new(), 16).unwrap();
        on_writable(&mut reference).unwrap();
        let expected = reference.stream.output.clone();
        assert_eq!(
            decode_header(expected[..HEADER_LEN].try_into().unwrap()) as usize,
            expected.len() - HEADER_LEN
        );

        for chunk in 1..=expected.len() {
            let mut stream = MockStream::new();
            stream.feed(&encode_frame(request));
            stream.write_limit = chunk;
            let mut conn = conn(stream);
            on_readable(&mut conn, &Echo::new(), 16).unwrap();

            // One accepted write per readiness event.
            let mut events = 0;
            loop {
                conn.stream.writes_before_block = 1;
                events += 1;
                match on_writable(&mut conn).unwrap() {
                    WriteOutcome::Blocked { .. } => {
                        let head = &conn.outbound[0];
                        assert!(head.response().write_offset() <= head.response().body_len());
                    }
                    WriteOutcome::Drained { completed } => {
                        assert_eq!(completed, 1);
                        break;
                    }
                }
            }

            assert_eq!(conn.stream.output, expected, "chunk size {chunk}");
            assert_eq!(events, expected.len().div_ceil(chunk));
            assert_eq!(conn.queued(), 0);
        }
    }

    #[test]
    fn test_would_block_keeps_cursor() {
        let mut stream = MockStream::new();
        stream.feed(&encode_frame(b"{}"));
        stream.writes_before_block = 0;
        let mut conn = conn(stream);
        on_readable(&mut conn, &Echo::new(), 16).unwrap();

        assert_eq!(
            on_writable(&mut conn).unwrap(),
            WriteOutcome::Blocked { completed: 0 }
        );
        assert_eq!(conn.outbound[0].written(), 0);
        assert!(conn.stream.output.is_empty());
    }

    #[test]
    fn test_responses_written_in_request_order() {
        let mut stream = MockStream::new();
        for name in ["r1", "r2", "r3"] {
            stream.feed(&encode_frame(format!("{{\"id\":\"{name}\"}}").as_bytes()));
        }
        stream.write_limit = 3;
        let mut conn = conn(stream);

        assert_eq!(
            on_readable(&mut conn, &Echo::new(), 16).unwrap(),
            ReadOutcome::Drained { dispatched: 3 }
        );
        assert_eq!(
            on_writable(&mut conn).unwrap(),
            WriteOutcome::Drained { completed: 3 }
        );

        let ids: Vec<Value> = frames(&conn.stream.output)
            .into_iter()
            .map(|v| v["echo"]["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("r1"), json!("r2"), json!("r3")]);
    }

    #[test]
    fn test_fatal_write_error() {
        let mut stream = MockStream::new();
        stream.feed(&encode_frame(b"{}"));
        stream.write_error = Some(io::ErrorKind::BrokenPipe);
        let mut conn = conn(stream);
        on_readable(&mut conn, &Echo::new(), 16).unwrap();

        let err = on_writable(&mut conn).unwrap_err();
        assert!(matches!(err, ConnError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    /// Response body that counts its own drops.
    struct TrackedBody {
        bytes: Vec<u8>,
        drops: Arc<AtomicUsize>,
    }

    impl AsRef<[u8]> for TrackedBody {
        fn as_ref(&self) -> &[u8] {
            &self.bytes
        }
    }

    impl Drop for TrackedBody {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Answers every request with a tracked body.
    fn tracking_dispatcher(drops: &Arc<AtomicUsize>) -> impl Fn(&Request, &mut Response) {
        let drops = Arc::clone(drops);
        move |_request: &Request, response: &mut Response| {
            response.set_raw(Bytes::from_owner(TrackedBody {
                bytes: b"{\"ok\":true}".to_vec(),
                drops: Arc::clone(&drops),
            }));
        }
    }

    #[test]
    fn test_written_exchange_releases_body() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut stream = MockStream::new();
        stream.feed(&encode_frame(b"{}"));
        stream.feed(&encode_frame(b"{}"));
        stream.write_limit = 5;
        let mut conn = conn(stream);

        on_readable(&mut conn, &tracking_dispatcher(&drops), 16).unwrap();
        assert_eq!(conn.queued(), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        // First response fully written, second still in flight.
        conn.stream.writes_before_block = 4;
        assert_eq!(
            on_writable(&mut conn).unwrap(),
            WriteOutcome::Blocked { completed: 1 }
        );
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        conn.stream.writes_before_block = usize::MAX;
        on_writable(&mut conn).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(frames(&conn.stream.output).len(), 2);
    }

    #[test]
    fn test_dropped_connection_releases_queued_exchanges() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut stream = MockStream::new();
        for _ in 0..3 {
            stream.feed(&encode_frame(b"{}"));
        }
        stream.write_limit = 2;
        stream.writes_before_block = 1;
        let mut conn = conn(stream);

        on_readable(&mut conn, &tracking_dispatcher(&drops), 16).unwrap();
        assert_eq!(
            on_writable(&mut conn).unwrap(),
            WriteOutcome::Blocked { completed: 0 }
        );
        assert_eq!(conn.outbound[0].written(), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(conn);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_interrupted_write_is_retried() {
        struct Flaky {
            interrupted: bool,
            output: Vec<u8>,
        }

        impl Write for Flaky {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if !self.interrupted {
                    self.interrupted = true;
                    return Err(io::ErrorKind::Interrupted.into());
                }
                self.output.extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut conn = Connection::new(
            Flaky {
                interrupted: false,
                output: Vec::new(),
            },
            "127.0.0.1:9000".parse().unwrap(),
            1024,
        );
        let mut exchange = Exchange::new(Request::parse(Bytes::from_static(b"{}")));
        exchange.seal().unwrap();
        conn.outbound.push_back(exchange);

        assert_eq!(
            on_writable(&mut conn).unwrap(),
            WriteOutcome::Drained { completed: 1 }
        );
        assert_eq!(conn.stream.output, encode_frame(b"{}"));
    }
}
