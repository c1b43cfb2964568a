//! Built-in RPC methods.
//!
//! Requests are JSON objects naming a method:
//!
//! ```text
//! Request:  {"id": 1, "method": "ping"}
//! Response: {"id": 1, "result": "pong"}
//!
//! Request:  {"id": 2, "method": "echo", "params": {"a": [1, 2]}}
//! Response: {"id": 2, "result": {"a": [1, 2]}}
//!
//! Request:  {"id": 3, "method": "nope"}
//! Response: {"id": 3, "error": {"code": -32601, "message": "method not found: nope"}}
//! ```
//!
//! `id` is copied back untouched (null when absent). Bodies that are not
//! JSON, or JSON without a string `method`, still get an error response.

pub mod methods;

pub use methods::Router;

/// Error codes, numbered as in JSON-RPC 2.0.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
}
