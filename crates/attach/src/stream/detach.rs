//! Detach key detection on the input stream.
//!
//! Keyboard input passes through a [`DetachFilter`] on its way to the remote
//! process. The filter forwards every byte untouched except an exact match
//! of the configured detach sequence, which it swallows and reports instead.
//! A sequence may arrive split across reads; the match cursor survives
//! between calls.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Buffer size for reading local input.
const READ_BUFFER_SIZE: usize = 4096;

/// Byte-level matcher for the detach sequence.
#[derive(Debug, Clone)]
pub struct DetachFilter {
    keys: Vec<u8>,
    matched: usize,
}

impl DetachFilter {
    /// Create a filter for the given sequence. An empty sequence never
    /// matches and passes everything through.
    pub fn new(keys: impl Into<Vec<u8>>) -> Self {
        Self {
            keys: keys.into(),
            matched: 0,
        }
    }

    /// The configured detach sequence.
    pub fn keys(&self) -> &[u8] {
        &self.keys
    }

    /// Whether detaching is disabled.
    pub fn is_passthrough(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of bytes currently held back as a partial match.
    pub fn pending(&self) -> usize {
        self.matched
    }

    /// Scan `input`, appending pass-through bytes to `out`.
    ///
    /// Returns `Some(consumed)` when the detach sequence completes at
    /// `input[consumed - 1]`. Bytes from `input[consumed..]` were not scanned
    /// and should be fed again later.
    pub fn filter(&mut self, input: &[u8], out: &mut Vec<u8>) -> Option<usize> {
        if self.keys.is_empty() {
            out.extend_from_slice(input);
            return None;
        }

        for (i, &byte) in input.iter().enumerate() {
            if self.step(byte, out) {
                return Some(i + 1);
            }
        }
        None
    }

    /// Release a dangling partial match as ordinary input.
    pub fn flush(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.keys[..self.matched]);
        self.matched = 0;
    }

    fn step(&mut self, byte: u8, out: &mut Vec<u8>) -> bool {
        loop {
            if byte == self.keys[self.matched] {
                self.matched += 1;
                if self.matched == self.keys.len() {
                    self.matched = 0;
                    return true;
                }
                return false;
            }

            if self.matched == 0 {
                out.push(byte);
                return false;
            }

            // Release the oldest held byte and rescan the rest of the
            // partial match, then retry `byte` against the new cursor.
            let partial = self.matched;
            self.matched = 0;
            out.push(self.keys[0]);
            for i in 1..partial {
                let replay = self.keys[i];
                let completed = self.step(replay, out);
                debug_assert!(!completed, "a proper prefix cannot complete the sequence");
            }
        }
    }
}

/// What a [`DetachReader::read`] call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Pass-through bytes are in the output buffer.
    Data,
    /// The detach sequence was typed. The output buffer holds any bytes
    /// that preceded it in the same read.
    Detach,
    /// The input source is exhausted.
    Eof,
}

/// An input source filtered through a [`DetachFilter`].
pub struct DetachReader<R> {
    inner: R,
    filter: DetachFilter,
    buf: Vec<u8>,
    carry: Vec<u8>,
}

impl<R: AsyncRead + Unpin> DetachReader<R> {
    /// Wrap `inner`, watching for `keys`.
    pub fn new(inner: R, keys: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            filter: DetachFilter::new(keys),
            buf: vec![0u8; READ_BUFFER_SIZE],
            carry: Vec::new(),
        }
    }

    /// Read the next batch of input into `out` (cleared first).
    ///
    /// Bytes that followed a detach sequence in the same underlying read are
    /// kept and scanned by the next call. This method is cancel-safe.
    pub async fn read(&mut self, out: &mut Vec<u8>) -> io::Result<InputEvent> {
        out.clear();

        if !self.carry.is_empty() {
            let carry = std::mem::take(&mut self.carry);
            if let Some(event) = scan(&mut self.filter, &carry, out, &mut self.carry) {
                return Ok(event);
            }
        }

        loop {
            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                self.filter.flush(out);
                return Ok(if out.is_empty() {
                    InputEvent::Eof
                } else {
                    InputEvent::Data
                });
            }

            if let Some(event) = scan(&mut self.filter, &self.buf[..n], out, &mut self.carry) {
                return Ok(event);
            }
        }
    }

    /// Unwrap the underlying source.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn scan(
    filter: &mut DetachFilter,
    input: &[u8],
    out: &mut Vec<u8>,
    carry: &mut Vec<u8>,
) -> Option<InputEvent> {
    if let Some(consumed) = filter.filter(input, out) {
        carry.extend_from_slice(&input[consumed..]);
        return Some(InputEvent::Detach);
    }
    // Everything may have been held back as a partial match.
    (!out.is_empty()).then_some(InputEvent::Data)
}
