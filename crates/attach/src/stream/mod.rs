//! Interactive session streaming.
//!
//! - [`detach`]: detach-sequence recognition on keyboard input
//! - [`resize`]: keeping the remote terminal size in sync
//! - [`session`]: the copy tasks and their orchestration

pub mod detach;
pub mod resize;
pub mod session;

pub use detach::{DetachFilter, DetachReader, InputEvent};
pub use resize::{
    ResizeMonitor, ResizeSettings, ResizeTracker, ResizeTrigger, Resizer, DEFAULT_INITIAL_RETRIES,
    DEFAULT_POLL_INTERVAL, DEFAULT_RETRY_DELAY,
};
pub use session::{LocalInput, LocalOutput, SessionOutcome, StreamError, StreamSession};

use tokio::io::{AsyncRead, AsyncWrite};

/// A hijacked duplex connection to a remote process.
///
/// Shutting down `writer` half-closes the connection; dropping both halves
/// closes it.
pub struct Transport {
    pub reader: LocalInput,
    pub writer: LocalOutput,
}

impl Transport {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split a single bidirectional stream into a transport.
    pub fn from_duplex<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}
