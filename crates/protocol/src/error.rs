//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame header names a stream that does not exist.
    #[error("unknown stream kind in frame header: {0}")]
    UnknownStream(u8),

    /// Stream ended in the middle of a frame.
    #[error("stream ended inside a frame: {missing} bytes missing")]
    Truncated {
        /// Bytes still expected when the stream ended.
        missing: usize,
    },

    // Detach key errors
    /// Detach key notation could not be parsed.
    #[error("invalid detach keys: {0}")]
    InvalidDetachKeys(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
