//! framed-rpc: a JSON RPC server over length-prefixed TCP frames.
//!
//! Wire format, both directions:
//! - 4-byte big-endian body length
//! - body of exactly that many bytes of JSON
//!
//! Features:
//! - Single-threaded mio event loop (epoll/kqueue)
//! - Partial reads and writes resume across readiness events
//! - Per-connection FIFO response queue with read backpressure
//! - Optional idle timeout
//! - Configuration via CLI arguments or TOML file
//!
//! Request handling is pluggable through [`runtime::Dispatcher`]; the
//! [`rpc::Router`] provides the built-in methods.

pub mod config;
pub mod rpc;
pub mod runtime;
