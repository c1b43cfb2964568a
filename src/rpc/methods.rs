//! Method routing.

use crate::rpc::codes;
use crate::runtime::{Dispatcher, Request, Response};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::trace;

/// A method implementation: params in, result or `(code, message)` out.
pub type Method = fn(&Value) -> Result<Value, (i64, String)>;

/// Dispatches requests to named methods.
pub struct Router {
    methods: HashMap<&'static str, Method>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// A router with the built-in `ping`, `echo` and `version` methods.
    pub fn new() -> Self {
        let mut router = Self {
            methods: HashMap::new(),
        };
        router.register("ping", ping);
        router.register("echo", echo);
        router.register("version", version);
        router
    }

    /// Add or replace a method.
    pub fn register(&mut self, name: &'static str, method: Method) {
        self.methods.insert(name, method);
    }

    fn call(&self, document: &Value) -> (Value, Result<Value, (i64, String)>) {
        let id = document.get("id").cloned().unwrap_or(Value::Null);

        let Some(name) = document.get("method").and_then(Value::as_str) else {
            let err = (codes::INVALID_REQUEST, "missing method".to_string());
            return (id, Err(err));
        };

        let result = match self.methods.get(name) {
            Some(method) => {
                trace!(method = name, "calling method");
                method(document.get("params").unwrap_or(&Value::Null))
            }
            None => Err((codes::METHOD_NOT_FOUND, format!("method not found: {name}"))),
        };
        (id, result)
    }
}

impl Dispatcher for Router {
    fn dispatch(&self, request: &Request, response: &mut Response) {
        let (id, result) = match request.document() {
            Some(document) => self.call(document),
            None => (
                Value::Null,
                Err((codes::PARSE_ERROR, "request body is not valid JSON".to_string())),
            ),
        };

        let body = response.document_mut();
        body["id"] = id;
        match result {
            Ok(value) => body["result"] = value,
            Err((code, message)) => body["error"] = json!({"code": code, "message": message}),
        }
    }
}

fn ping(_params: &Value) -> Result<Value, (i64, String)> {
    Ok(Value::from("pong"))
}

fn echo(params: &Value) -> Result<Value, (i64, String)> {
    Ok(params.clone())
}

fn version(_params: &Value) -> Result<Value, (i64, String)> {
    Ok(Value::from(env!("CARGO_PKG_VERSION")))
}
