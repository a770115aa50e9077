//! Terminator-delimited frame codec.
//!
//! `DelimitedCodec` turns a byte stream into discrete payloads by splitting
//! on a configurable terminator sequence (CRLF by default) and encodes an
//! outgoing payload as a direct byte passthrough followed by the terminator.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default terminator used when none is configured.
pub const CRLF: &[u8] = b"\r\n";

/// Default upper bound on a single frame's payload length.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Errors raised while decoding or encoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The peer sent more bytes than the configured frame limit without a
    /// terminator, or a terminated frame exceeded the limit.
    #[error("frame of {length} bytes exceeds limit of {limit} bytes")]
    FrameTooLong {
        /// Observed length in bytes.
        length: usize,
        /// Configured maximum payload length.
        limit: usize,
    },
    /// An I/O error from the underlying transport.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Codec splitting a stream on a terminator byte sequence.
///
/// Decoding strips the terminator; encoding appends it. The codec keeps a
/// resume offset so partially received frames are not rescanned on every
/// read.
#[derive(Clone, Debug)]
pub struct DelimitedCodec {
    terminator: Bytes,
    max_frame_length: usize,
    next_index: usize,
}

impl DelimitedCodec {
    /// Create a codec splitting on `terminator`.
    ///
    /// # Panics
    ///
    /// Panics if `terminator` is empty.
    #[must_use]
    pub fn new(terminator: impl Into<Bytes>) -> Self {
        let terminator = terminator.into();
        assert!(!terminator.is_empty(), "terminator must not be empty");
        Self {
            terminator,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            next_index: 0,
        }
    }

    /// Create a codec splitting on CRLF.
    #[must_use]
    pub fn crlf() -> Self { Self::new(CRLF) }

    /// Replace the maximum payload length.
    #[must_use]
    pub fn max_frame_length(mut self, limit: usize) -> Self {
        self.max_frame_length = limit;
        self
    }

    /// The terminator this codec splits on.
    #[must_use]
    pub fn terminator(&self) -> &[u8] { &self.terminator }

    fn find_terminator(&self, haystack: &[u8]) -> Option<usize> {
        haystack
            .windows(self.terminator.len())
            .position(|window| *window == self.terminator[..])
    }
}

impl Default for DelimitedCodec {
    fn default() -> Self { Self::crlf() }
}

impl Decoder for DelimitedCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if let Some(offset) = self.find_terminator(&src[self.next_index..]) {
            let end = self.next_index + offset;
            self.next_index = 0;
            if end > self.max_frame_length {
                return Err(CodecError::FrameTooLong {
                    length: end,
                    limit: self.max_frame_length,
                });
            }
            let frame = src.split_to(end).freeze();
            src.advance(self.terminator.len());
            return Ok(Some(frame));
        }
        if src.len() > self.max_frame_length + self.terminator.len() {
            return Err(CodecError::FrameTooLong {
                length: src.len(),
                limit: self.max_frame_length,
            });
        }
        // Resume scanning at the tail that could still hold a partial
        // terminator; everything before it has already been searched.
        self.next_index = src.len().saturating_sub(self.terminator.len() - 1);
        Ok(None)
    }
}

impl Encoder<Bytes> for DelimitedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(item.len() + self.terminator.len());
        dst.extend_from_slice(&item);
        dst.extend_from_slice(&self.terminator);
        Ok(())
    }
}
