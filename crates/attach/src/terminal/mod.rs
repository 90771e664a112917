//! Local terminal module.
//!
//! This module owns everything that touches the user's own terminal:
//! switching it into raw mode for the duration of a session, reading its
//! dimensions for the remote pseudo-terminal and reading its input.

pub mod raw;
pub mod size;
pub mod stdin;

pub use raw::{RawModeGuard, RawTerminal, StdioModes, TerminalControl, TerminalModes};
pub use size::{FixedSize, LocalTerminalSize, SizeSource, TerminalSize};
pub use stdin::{spawn_reader, stdin_reader};
