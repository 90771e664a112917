//! Process stdin, read on a dedicated thread.
//!
//! `tokio::io::stdin` parks a blocking-pool thread in `read`, and dropping
//! the runtime waits for that thread, so an idle terminal would hold the
//! process open after the session has ended. Here the blocking read runs on
//! a plain named thread that the runtime never joins; chunks are handed to
//! the async side through a channel and an in-memory pipe.

use std::io::{self, Read};
use std::thread;

use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::trace;

/// Size of a single blocking read.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks queued between the reader thread and the pipe.
const CHANNEL_CAPACITY: usize = 16;

/// Capacity of the pipe handed to the session.
const PIPE_CAPACITY: usize = 16 * 1024;

/// Stream the process's standard input.
///
/// Must be called from within a tokio runtime.
pub fn stdin_reader() -> io::Result<DuplexStream> {
    spawn_reader("stdin-read", io::stdin())
}

/// Read `source` on a named thread and expose it as an async stream.
///
/// The returned stream reports EOF once `source` does. Dropping it stops
/// the forwarding task; the thread exits after its current read returns.
pub fn spawn_reader<R>(name: &str, source: R) -> io::Result<DuplexStream>
where
    R: Read + Send + 'static,
{
    let (stream, mut pipe) = duplex(PIPE_CAPACITY);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);

    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || read_loop(source, tx))?;

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if pipe.write_all(&chunk).await.is_err() {
                break;
            }
        }
        // Dropping the pipe end reports EOF to the reader.
    });

    Ok(stream)
}

fn read_loop<R: Read>(mut source: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                trace!(error = %e, "Input read ended");
                break;
            }
        }
    }
}
