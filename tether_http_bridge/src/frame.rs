//! Newline-delimited JSON frame decoding.
//!
//! The subprocess speaks one JSON value per line. [`ReadBuffer`] turns the
//! arbitrarily-chunked byte stream from its stdout into discrete decoded
//! messages: raw bytes go in via [`ReadBuffer::append`], complete frames
//! come out via [`ReadBuffer::read_message`]. A partial frame stays
//! buffered until its terminating newline arrives; leftover bytes at
//! end-of-stream are never decoded.

use bytes::BytesMut;
use serde_json::Value;

use crate::error::{BridgeError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Incremental decoder for newline-terminated JSON frames.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: BytesMut,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Append raw bytes to the buffer. Never decodes, never fails on
    /// partial data.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract and decode exactly one complete newline-terminated frame.
    ///
    /// Returns `Ok(None)` when no complete frame is buffered yet — one
    /// append may complete zero, one, or many frames, so call this in a
    /// loop until it returns `Ok(None)`. Blank frames are skipped and a
    /// trailing `\r` is stripped. A completed frame that is not valid
    /// JSON yields [`BridgeError::MalformedFrame`]; its bytes are already
    /// consumed, so the next call resumes at the following frame boundary.
    pub fn read_message(&mut self) -> Result<Option<Value>> {
        loop {
            let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let frame = self.buf.split_to(newline + 1);
            let mut line = &frame[..newline];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return match serde_json::from_slice(line) {
                Ok(value) => Ok(Some(value)),
                Err(err) => Err(BridgeError::MalformedFrame(format!(
                    "{} in {:?}",
                    err,
                    String::from_utf8_lossy(line)
                ))),
            };
        }
    }

    /// Number of buffered bytes that are not yet part of a complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}
