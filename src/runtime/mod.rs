//! Single-threaded readiness-driven runtime.
//!
//! Layers, leaves first:
//! - `frame`: length-prefixed wire format and incremental decoder
//! - `exchange`: request/response pairs and the write cursor
//! - `connection`: per-client state and the slab-backed registry
//! - `handler`: read/write handlers run on socket readiness
//! - `event_loop`: mio poller, acceptor, interest bookkeeping
//!
//! Request handling itself sits behind the `Dispatcher` trait.

mod connection;
mod dispatch;
mod event_loop;
mod exchange;
pub mod frame;
mod handler;

pub use dispatch::Dispatcher;
pub use event_loop::{Server, ShutdownHandle};
pub use exchange::{Request, Response};
