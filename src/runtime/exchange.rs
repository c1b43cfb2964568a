//! Request/response pairs queued on a connection.

use crate::runtime::frame::{encode_header, HEADER_LEN};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::io::IoSlice;

/// A request body read off the wire.
#[derive(Debug)]
pub struct Request {
    raw: Bytes,
    document: Option<Value>,
}

impl Request {
    /// Wrap a frame body, parsing it as JSON.
    ///
    /// A body that is not valid JSON yields a request without a document;
    /// the dispatcher decides how to answer it.
    pub fn parse(raw: Bytes) -> Self {
        let document = serde_json::from_slice(&raw).ok();
        Self { raw, document }
    }

    /// Raw body bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Parsed document, `None` if the body was not valid JSON.
    pub fn document(&self) -> Option<&Value> {
        self.document.as_ref()
    }
}

/// A response being built by the dispatcher and then written out.
#[derive(Debug)]
pub struct Response {
    raw: Option<Bytes>,
    body_len: u32,
    write_offset: u32,
    document: Value,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// An empty response whose document is an empty JSON object.
    pub fn new() -> Self {
        Self {
            raw: None,
            body_len: 0,
            write_offset: 0,
            document: Value::Object(Map::new()),
        }
    }

    /// The document under construction.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Mutable access to the document under construction.
    pub fn document_mut(&mut self) -> &mut Value {
        &mut self.document
    }

    /// Replace the document.
    pub fn set_document(&mut self, document: Value) {
        self.document = document;
    }

    /// Supply pre-serialized body bytes, bypassing document serialization.
    pub fn set_raw(&mut self, raw: impl Into<Bytes>) {
        self.raw = Some(raw.into());
    }

    /// Serialized body, available once sealed.
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    /// Body length in bytes, set when sealed.
    pub fn body_len(&self) -> u32 {
        self.body_len
    }

    /// Body bytes already written to the peer.
    pub fn write_offset(&self) -> u32 {
        self.write_offset
    }

    /// Freeze the response for writing.
    ///
    /// Serializes the document unless raw bytes were supplied. Fails with the
    /// body size if it cannot be described by the length header.
    fn seal(&mut self) -> Result<(), usize> {
        let raw = match self.raw.take() {
            Some(raw) => raw,
            None => Bytes::from(
                serde_json::to_vec(&self.document).unwrap_or_else(|_| b"null".to_vec()),
            ),
        };
        self.body_len = u32::try_from(raw.len()).map_err(|_| raw.len())?;
        self.write_offset = 0;
        self.raw = Some(raw);
        Ok(())
    }

    fn remaining_body(&self) -> &[u8] {
        match &self.raw {
            Some(raw) => &raw[self.write_offset as usize..self.body_len as usize],
            None => &[],
        }
    }
}

/// A request paired with its response, queued until fully written.
///
/// Header and body are written as one byte stream: the cursor first moves
/// through the header, then through the body via the response's
/// `write_offset`.
#[derive(Debug)]
pub struct Exchange {
    request: Request,
    response: Response,
    header: [u8; HEADER_LEN],
    header_written: usize,
}

impl Exchange {
    /// Pair a request with a fresh, empty response.
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: Response::new(),
            header: [0; HEADER_LEN],
            header_written: 0,
        }
    }

    /// The request as read off the wire.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The response, sealed once queued.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Split borrow used to hand both halves to a dispatcher.
    pub fn parts_mut(&mut self) -> (&Request, &mut Response) {
        (&self.request, &mut self.response)
    }

    /// Serialize the response and encode its header.
    pub fn seal(&mut self) -> Result<(), usize> {
        self.response.seal()?;
        self.header = encode_header(self.response.body_len);
        self.header_written = 0;
        Ok(())
    }

    /// Total bytes on the wire for this response.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.response.body_len as usize
    }

    /// Bytes of header and body already written.
    pub fn written(&self) -> usize {
        self.header_written + self.response.write_offset as usize
    }

    /// True once header and body have been fully written.
    pub fn is_flushed(&self) -> bool {
        self.header_written == HEADER_LEN && self.response.write_offset == self.response.body_len
    }

    /// Unwritten bytes, header tail first.
    pub fn pending_slices(&self) -> [IoSlice<'_>; 2] {
        [
            IoSlice::new(&self.header[self.header_written..]),
            IoSlice::new(self.response.remaining_body()),
        ]
    }

    /// Record `n` bytes as written.
    pub fn advance(&mut self, n: usize) {
        let header_part = n.min(HEADER_LEN - self.header_written);
        self.header_written += header_part;

        let body_part = (n - header_part) as u32;
        self.response.write_offset += body_part;
        debug_assert!(self.response.write_offset <= self.response.body_len);
    }
}
