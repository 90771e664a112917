//! # Dockside Protocol Library
//!
//! This crate holds the byte-level formats spoken over an interactive
//! attach or exec session with a container engine. It does no I/O; the
//! `attach` crate drives these types from its copy tasks.
//!
//! ## Overview
//!
//! - **Multiplexed framing**: Without a pseudo-terminal the engine interleaves
//!   the remote stdout and stderr on one connection, each chunk prefixed with
//!   an 8-byte header. [`FrameDecoder`] splits them apart incrementally.
//! - **Detach keys**: The in-band key sequence that ends an interactive view
//!   is configured in `ctrl-p,ctrl-q` notation and parsed into raw bytes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Local terminal (raw mode)        │
//! ├─────────────────────────────────────────┤
//! │   Detach keys       │   Stdio framing   │  input filter / output demux
//! ├─────────────────────────────────────────┤
//! │      Hijacked duplex transport          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{encode_frame, FrameDecoder, StreamKind};
//!
//! let mut wire = encode_frame(StreamKind::Stdout, b"hello\n");
//! wire.extend(encode_frame(StreamKind::Stderr, b"oops\n"));
//!
//! let mut decoder = FrameDecoder::new();
//! decoder.push(&wire);
//! let first = decoder.next_frame().unwrap().unwrap();
//! assert_eq!(first.kind, StreamKind::Stdout);
//! assert_eq!(&first.payload[..], b"hello\n");
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Multiplexed stdout/stderr frame format
//! - [`detach`]: Detach key notation
//! - [`error`]: Error types

pub mod detach;
pub mod error;
pub mod framing;

pub use detach::{
    format_detach_keys, parse_detach_keys, DEFAULT_DETACH_KEYS, DEFAULT_DETACH_KEYS_NOTATION,
};
pub use error::{ProtocolError, Result};
pub use framing::{
    encode_frame, Frame, FrameDecoder, FrameHeader, StreamKind, FRAME_HEADER_SIZE, MAX_FRAME_SIZE,
};
