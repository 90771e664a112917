//! The interactive stream session.
//!
//! A [`StreamSession`] pumps bytes between the local terminal and a hijacked
//! engine connection until one side finishes, the user detaches, or the
//! caller cancels.
//!
//! ```text
//!   input ──► DetachReader ──► input task ──► transport write half
//!                                   │ (half-close on end)
//!   output ◄── output task ◄── transport read half
//!   (flat copy for a tty, demultiplexed stdout/stderr otherwise)
//! ```
//!
//! Both copy tasks report once through a oneshot channel. The orchestrator
//! in [`StreamSession::stream`] races those reports against cancellation.
//! Tasks that are still running when `stream` returns are stopped at their
//! next read through a session-scoped child token.

use std::io;
use std::sync::Arc;

use protocol::{FrameDecoder, ProtocolError, StreamKind, DEFAULT_DETACH_KEYS};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::detach::{DetachReader, InputEvent};
use super::Transport;
use crate::terminal::{RawModeGuard, TerminalControl};

/// Buffer size for copying between the transport and local streams.
const COPY_BUFFER_SIZE: usize = 8192;

/// Local readable byte source.
pub type LocalInput = Box<dyn AsyncRead + Send + Unpin>;

/// Local writable byte sink.
pub type LocalOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors that end a stream session.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Raw mode could not be entered; the session never started.
    #[error("failed to enter raw terminal mode: {0}")]
    RawMode(#[source] io::Error),

    /// Transport or local stream I/O failed.
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),

    /// The multiplexed output stream was malformed.
    #[error("malformed output stream: {0}")]
    Protocol(#[from] ProtocolError),

    /// The session was cancelled.
    #[error("session cancelled")]
    Cancelled,

    /// A copy task stopped without reporting.
    #[error("copy task ended without reporting")]
    TaskAborted,
}

/// How a session ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The remote side finished (or input ended with no output to wait for).
    Completed,
    /// The user typed the detach sequence; the remote process keeps running.
    Detached,
}

impl SessionOutcome {
    pub fn is_detached(self) -> bool {
        self == Self::Detached
    }
}

/// How the input task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputEnd {
    Eof,
    Detached,
}

/// One interactive session over a hijacked transport.
///
/// Built once per attach or exec and consumed by [`stream`](Self::stream).
pub struct StreamSession {
    id: Uuid,
    transport: Transport,
    input: Option<LocalInput>,
    output: Option<LocalOutput>,
    err_output: Option<LocalOutput>,
    tty: bool,
    detach_keys: Vec<u8>,
    terminal: Option<Arc<dyn TerminalControl>>,
}

impl StreamSession {
    /// Create a session over `transport` with no local streams attached.
    pub fn new(transport: Transport) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            input: None,
            output: None,
            err_output: None,
            tty: false,
            detach_keys: DEFAULT_DETACH_KEYS.to_vec(),
            terminal: None,
        }
    }

    /// Identifier used in log fields.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn input(mut self, input: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.input = Some(Box::new(input));
        self
    }

    pub fn output(mut self, output: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    /// Sink for remote stderr. Only used when the remote side has no tty.
    pub fn err_output(mut self, err_output: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.err_output = Some(Box::new(err_output));
        self
    }

    /// Whether the remote side runs in a pseudo-terminal.
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Detach sequence. Empty disables detaching.
    pub fn detach_keys(mut self, keys: impl Into<Vec<u8>>) -> Self {
        self.detach_keys = keys.into();
        self
    }

    /// Terminal to put into raw mode while streaming a tty session.
    pub fn terminal(mut self, terminal: Arc<dyn TerminalControl>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    /// Run the session to completion.
    ///
    /// The output task finishing decides the result. Input ending normally
    /// waits for output, unless there is no output sink. Detaching returns
    /// at once without waiting for output. Cancellation wins over both.
    /// Raw mode, when entered, is restored exactly once before returning.
    pub async fn stream(self, cancel: CancellationToken) -> Result<SessionOutcome, StreamError> {
        let Self {
            id,
            transport,
            input,
            output,
            err_output,
            tty,
            detach_keys,
            terminal,
        } = self;

        let _raw_mode = match (&input, tty, terminal) {
            (Some(_), true, Some(terminal)) => {
                Some(RawModeGuard::enter(terminal).map_err(StreamError::RawMode)?)
            }
            _ => None,
        };

        debug!(session_id = %id, tty, "Stream session started");

        // Stops whatever copy task is still running once this call returns.
        let teardown = cancel.child_token();
        let _teardown_guard = teardown.clone().drop_guard();

        let Transport { reader, writer } = transport;

        // The read half stays open for the whole call even without a sink.
        let (mut output_rx, _idle_reader) = if output.is_some() || err_output.is_some() {
            let (tx, rx) = oneshot::channel();
            let token = teardown.clone();
            tokio::spawn(async move {
                let result = if tty {
                    copy_output(reader, output, token).await
                } else {
                    demux_output(reader, output, err_output, token).await
                };
                trace!(session_id = %id, ok = result.is_ok(), "Output task finished");
                let _ = tx.send(result);
            });
            (Some(rx), None)
        } else {
            (None, Some(reader))
        };

        let mut input_rx = None;
        if let Some(input) = input {
            let (tx, rx) = oneshot::channel();
            let token = teardown.clone();
            let reader = DetachReader::new(input, detach_keys);
            tokio::spawn(async move {
                let result = copy_input(reader, writer, token).await;
                trace!(session_id = %id, ok = result.is_ok(), "Input task finished");
                let _ = tx.send(result);
            });
            input_rx = Some(rx);
        }

        let has_output = output_rx.is_some();
        if !has_output && input_rx.is_none() {
            debug!(session_id = %id, "Nothing to stream");
            return Ok(SessionOutcome::Completed);
        }

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Err(StreamError::Cancelled),

                reported = recv_report(&mut output_rx) => {
                    break match reported {
                        Some(result) => result.map(|()| SessionOutcome::Completed),
                        None => Err(StreamError::TaskAborted),
                    };
                }

                reported = recv_report(&mut input_rx) => {
                    input_rx = None;
                    match reported {
                        Some(Ok(InputEnd::Detached)) => break Ok(SessionOutcome::Detached),
                        Some(Ok(InputEnd::Eof)) if !has_output => {
                            break Ok(SessionOutcome::Completed)
                        }
                        Some(Ok(InputEnd::Eof)) => {
                            debug!(session_id = %id, "Input finished, waiting for output");
                        }
                        Some(Err(e)) => break Err(e),
                        None => break Err(StreamError::TaskAborted),
                    }
                }
            }
        };

        match &result {
            Ok(outcome) => debug!(session_id = %id, ?outcome, "Stream session ended"),
            Err(StreamError::Cancelled) => debug!(session_id = %id, "Stream session cancelled"),
            Err(e) => warn!(session_id = %id, error = %e, "Stream session failed"),
        }
        result
    }
}

/// Wait for a task report, or forever when there is no task left to hear
/// from. `None` means the task dropped its sender.
async fn recv_report<T>(rx: &mut Option<oneshot::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

async fn copy_output(
    mut reader: LocalInput,
    mut output: Option<LocalOutput>,
    teardown: CancellationToken,
) -> Result<(), StreamError> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = teardown.cancelled() => return Err(StreamError::Cancelled),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(());
        }
        if let Some(output) = output.as_mut() {
            output.write_all(&buf[..n]).await?;
            output.flush().await?;
        }
    }
}

async fn demux_output(
    mut reader: LocalInput,
    mut output: Option<LocalOutput>,
    mut err_output: Option<LocalOutput>,
    teardown: CancellationToken,
) -> Result<(), StreamError> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = teardown.cancelled() => return Err(StreamError::Cancelled),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            decoder.finish()?;
            return Ok(());
        }

        decoder.push(&buf[..n]);
        while let Some(frame) = decoder.next_frame()? {
            let sink = match frame.kind {
                StreamKind::Stderr => err_output.as_mut(),
                StreamKind::Stdout | StreamKind::Stdin => output.as_mut(),
            };
            if let Some(sink) = sink {
                sink.write_all(&frame.payload).await?;
                sink.flush().await?;
            }
        }
    }
}

async fn copy_input(
    mut reader: DetachReader<LocalInput>,
    mut writer: LocalOutput,
    teardown: CancellationToken,
) -> Result<InputEnd, StreamError> {
    let mut buf = Vec::with_capacity(COPY_BUFFER_SIZE);
    let end = loop {
        let event = tokio::select! {
            _ = teardown.cancelled() => return Err(StreamError::Cancelled),
            event = reader.read(&mut buf) => event,
        };
        match event {
            Ok(InputEvent::Data) => {
                if let Err(e) = write_chunk(&mut writer, &buf).await {
                    break Err(e.into());
                }
            }
            Ok(InputEvent::Detach) => {
                if !buf.is_empty() {
                    if let Err(e) = write_chunk(&mut writer, &buf).await {
                        break Err(e.into());
                    }
                }
                debug!("Detach sequence received");
                break Ok(InputEnd::Detached);
            }
            Ok(InputEvent::Eof) => break Ok(InputEnd::Eof),
            Err(e) => break Err(e.into()),
        }
    };

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Failed to half-close transport");
    }
    end
}

async fn write_chunk(writer: &mut LocalOutput, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}
