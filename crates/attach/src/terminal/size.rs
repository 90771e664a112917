//! Local terminal dimensions.

use tracing::trace;

/// A terminal size as `(width, height)` in columns and rows.
pub type TerminalSize = (u16, u16);

/// Something that can report the local terminal's current size.
pub trait SizeSource: Send + Sync {
    /// Current `(width, height)`, or `None` if it cannot be determined.
    fn size(&self) -> Option<TerminalSize>;
}

/// Reads the size of the terminal attached to this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTerminalSize;

impl SizeSource for LocalTerminalSize {
    fn size(&self) -> Option<TerminalSize> {
        match crossterm::terminal::size() {
            Ok(size) => Some(size),
            Err(e) => {
                trace!(error = %e, "Could not read terminal size");
                None
            }
        }
    }
}

/// A size source that always reports the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedSize(pub Option<TerminalSize>);

impl SizeSource for FixedSize {
    fn size(&self) -> Option<TerminalSize> {
        self.0
    }
}
