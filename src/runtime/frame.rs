//! Wire framing.
//!
//! Every message in either direction is a fixed-width length header followed
//! by exactly that many body bytes:
//!
//! ```text
//! +----------------------+---------------------------+
//! | length (u32, BE)     | body (length bytes, JSON) |
//! +----------------------+---------------------------+
//! ```
//!
//! The header is always big-endian so that hosts of different endianness
//! agree on the length.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Width of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Framing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Header announced a body larger than the configured maximum.
    #[error("frame body of {len} bytes exceeds maximum of {max} bytes")]
    TooLarge { len: u32, max: u32 },
}

/// Decode a length header.
///
/// No validation is done here; callers enforce bounds with [`validate`].
pub fn decode_header(header: [u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes(header)
}

/// Encode a length header.
pub fn encode_header(body_len: u32) -> [u8; HEADER_LEN] {
    body_len.to_be_bytes()
}

/// Check a decoded body length against the maximum frame size.
pub fn validate(body_len: u32, max: u32) -> Result<(), FrameError> {
    if body_len > max {
        return Err(FrameError::TooLarge { len: body_len, max });
    }
    Ok(())
}

/// Encode a complete frame (header + body).
///
/// # Panics
/// Panics if `body` is longer than `u32::MAX` bytes.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let len = u32::try_from(body.len()).expect("frame body exceeds u32::MAX");
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&encode_header(len));
    out.extend_from_slice(body);
    out
}

/// Progress through the frame currently being read.
#[derive(Debug)]
enum DecodeState {
    /// Accumulating the length header.
    Header {
        buf: [u8; HEADER_LEN],
        filled: usize,
    },
    /// Accumulating a body of known length.
    Body { buf: BytesMut, filled: usize },
}

/// Incremental frame decoder.
///
/// Holds a header-in-progress or a body-in-progress so that a frame split
/// across any number of reads is reassembled correctly. [`spare`] never
/// exposes more than the remainder of the current frame part, so a reader
/// driving the decoder never consumes bytes belonging to the next frame.
///
/// [`spare`]: FrameDecoder::spare
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    max_frame_size: u32,
}

impl FrameDecoder {
    /// Create a decoder accepting bodies up to `max_frame_size` bytes.
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            state: DecodeState::Header {
                buf: [0; HEADER_LEN],
                filled: 0,
            },
            max_frame_size,
        }
    }

    /// True when no frame is partially read.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Header { filled: 0, .. })
    }

    /// The slice the next read should fill.
    pub fn spare(&mut self) -> &mut [u8] {
        match &mut self.state {
            DecodeState::Header { buf, filled } => &mut buf[*filled..],
            DecodeState::Body { buf, filled } => &mut buf[*filled..],
        }
    }

    /// Commit `n` bytes written into [`spare`](FrameDecoder::spare).
    ///
    /// Returns the body once a frame completes. An oversized header is
    /// reported as soon as its last byte arrives.
    pub fn advance(&mut self, n: usize) -> Result<Option<Bytes>, FrameError> {
        match &mut self.state {
            DecodeState::Header { buf, filled } => {
                *filled += n;
                debug_assert!(*filled <= HEADER_LEN);
                if *filled < HEADER_LEN {
                    return Ok(None);
                }

                let body_len = decode_header(*buf);
                validate(body_len, self.max_frame_size)?;

                if body_len == 0 {
                    self.reset();
                    return Ok(Some(Bytes::new()));
                }

                self.state = DecodeState::Body {
                    buf: BytesMut::zeroed(body_len as usize),
                    filled: 0,
                };
                Ok(None)
            }
            DecodeState::Body { buf, filled } => {
                *filled += n;
                debug_assert!(*filled <= buf.len());
                if *filled < buf.len() {
                    return Ok(None);
                }

                let body = std::mem::take(buf).freeze();
                self.reset();
                Ok(Some(body))
            }
        }
    }

    fn reset(&mut self) {
        self.state = DecodeState::Header {
            buf: [0; HEADER_LEN],
            filled: 0,
        };
    }
}
