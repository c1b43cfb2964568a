//! The seam between the I/O runtime and request handling.

use crate::runtime::exchange::{Request, Response};

/// Maps a request to a response.
///
/// Called synchronously on the reactor thread, so implementations must not
/// block on I/O. The response must always be left populated, even when the
/// request is malformed or handling fails internally: the server writes
/// back whatever the response holds.
pub trait Dispatcher {
    fn dispatch(&self, request: &Request, response: &mut Response);
}

impl<F> Dispatcher for F
where
    F: Fn(&Request, &mut Response),
{
    fn dispatch(&self, request: &Request, response: &mut Response) {
        self(request, response)
    }
}
