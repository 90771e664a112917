//! Multiplexed stdio framing.
//!
//! When an exec or attach session runs without a pseudo-terminal, the engine
//! interleaves the remote process's stdout and stderr on one connection.
//! Every chunk is prefixed with a header naming the stream it belongs to.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 1 byte: stream kind (0 = stdin, 1 = stdout, 2 = stderr)
//! - 3 bytes: reserved, always zero
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload
//!
//! Frames can be split arbitrarily across transport reads, so decoding is
//! incremental: push whatever arrived into a [`FrameDecoder`] and drain
//! complete frames from it.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Frame header size: 1 (kind) + 3 (reserved) + 4 (length) = 8 bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum payload size accepted in a single frame (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// The remote stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamKind {
    /// Echoed standard input.
    Stdin = 0,
    /// Standard output.
    Stdout = 1,
    /// Standard error.
    Stderr = 2,
}

impl StreamKind {
    /// Get the raw byte used in frame headers.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for StreamKind {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(StreamKind::Stdin),
            1 => Ok(StreamKind::Stdout),
            2 => Ok(StreamKind::Stderr),
            other => Err(ProtocolError::UnknownStream(other)),
        }
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream the payload belongs to.
    pub kind: StreamKind,
    /// Payload length in bytes.
    pub len: usize,
}

impl FrameHeader {
    /// Parse a header from its 8-byte wire form.
    ///
    /// The reserved bytes are ignored.
    pub fn parse(raw: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let kind = StreamKind::try_from(raw[0])?;
        let len = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        Ok(Self { kind, len })
    }
}

/// A complete decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream the payload belongs to.
    pub kind: StreamKind,
    /// The payload bytes.
    pub payload: Bytes,
}

/// Encode a payload as one frame.
///
/// Empty payloads produce no bytes at all; a zero-length frame carries no
/// information for the reader.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return Vec::new();
    }

    let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    output.push(kind.as_byte());
    output.extend_from_slice(&[0, 0, 0]);
    output.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    output.extend_from_slice(payload);
    output
}

/// Incremental decoder for multiplexed frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    header: Option<FrameHeader>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if self.buf.len() < FRAME_HEADER_SIZE {
                    return Ok(None);
                }
                let mut raw = [0u8; FRAME_HEADER_SIZE];
                raw.copy_from_slice(&self.buf[..FRAME_HEADER_SIZE]);
                let header = FrameHeader::parse(&raw)?;
                self.buf.advance(FRAME_HEADER_SIZE);
                self.header = Some(header);
                header
            }
        };

        if self.buf.len() < header.len {
            return Ok(None);
        }

        let payload = self.buf.split_to(header.len).freeze();
        self.header = None;

        Ok(Some(Frame {
            kind: header.kind,
            payload,
        }))
    }

    /// Check that the stream ended on a frame boundary.
    pub fn finish(&self) -> Result<()> {
        let missing = match self.header {
            Some(header) => header.len.saturating_sub(self.buf.len()),
            None if self.buf.is_empty() => 0,
            None => FRAME_HEADER_SIZE.saturating_sub(self.buf.len()),
        };

        if missing > 0 {
            return Err(ProtocolError::Truncated { missing });
        }
        Ok(())
    }
}
