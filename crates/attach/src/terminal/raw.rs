//! Raw terminal mode control.
//!
//! A [`RawTerminal`] owns the terminal attributes captured when raw mode was
//! entered and puts them back exactly once. It is an explicit object handed
//! to each session rather than process-wide state, so two sessions (or two
//! tests) never overwrite each other's saved attributes.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

/// Low-level switching between cooked and raw modes.
///
/// `make_raw` captures whatever it needs to undo the switch and returns it;
/// `apply` puts the captured state back.
pub trait TerminalModes: Send {
    /// Captured attributes.
    type Saved: Send;

    /// Capture the current attributes and switch to raw mode.
    fn make_raw(&mut self) -> io::Result<Self::Saved>;

    /// Reapply previously captured attributes.
    fn apply(&mut self, saved: Self::Saved) -> io::Result<()>;
}

/// Object-safe handle a session uses to enter and leave raw mode.
pub trait TerminalControl: Send + Sync {
    /// Switch to raw mode. A no-op when already raw.
    fn enter(&self) -> io::Result<()>;

    /// Restore the captured attributes. A no-op when not raw.
    fn restore(&self);

    /// Whether captured attributes are waiting to be restored.
    fn is_raw(&self) -> bool;
}

struct Inner<M: TerminalModes> {
    modes: M,
    saved: Option<M::Saved>,
}

/// Raw mode controller with idempotent restore.
///
/// The captured attributes live behind a mutex; `restore` takes them out
/// under the lock, so concurrent and repeated calls restore at most once per
/// `enter`. Dropping the controller restores as well.
pub struct RawTerminal<M: TerminalModes = StdioModes> {
    inner: Mutex<Inner<M>>,
}

impl RawTerminal<StdioModes> {
    /// Controller for the process's standard input and output.
    pub fn stdio() -> Self {
        Self::new(StdioModes::default())
    }
}

impl<M: TerminalModes> RawTerminal<M> {
    /// Create a controller over the given mode backend.
    pub fn new(modes: M) -> Self {
        Self {
            inner: Mutex::new(Inner { modes, saved: None }),
        }
    }

    // Restoring must still work after a panic poisoned the lock.
    fn lock(&self) -> MutexGuard<'_, Inner<M>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M: TerminalModes> TerminalControl for RawTerminal<M> {
    fn enter(&self) -> io::Result<()> {
        let mut inner = self.lock();
        if inner.saved.is_some() {
            debug!("Terminal already in raw mode");
            return Ok(());
        }

        let saved = inner.modes.make_raw()?;
        inner.saved = Some(saved);
        debug!("Entered raw terminal mode");
        Ok(())
    }

    fn restore(&self) {
        let mut inner = self.lock();
        let Some(saved) = inner.saved.take() else {
            return;
        };

        match inner.modes.apply(saved) {
            Ok(()) => debug!("Restored terminal attributes"),
            Err(e) => warn!(error = %e, "Failed to restore terminal attributes"),
        }
    }

    fn is_raw(&self) -> bool {
        self.lock().saved.is_some()
    }
}

impl<M: TerminalModes> Drop for RawTerminal<M> {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Restores raw mode when dropped.
///
/// Held by a session for the duration of `stream`, so every return path,
/// including unwinding, leaves the terminal as it was found.
pub struct RawModeGuard {
    terminal: Arc<dyn TerminalControl>,
}

impl RawModeGuard {
    /// Enter raw mode and return a guard that undoes it.
    pub fn enter(terminal: Arc<dyn TerminalControl>) -> io::Result<Self> {
        terminal.enter()?;
        Ok(Self { terminal })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.terminal.restore();
    }
}

#[cfg(unix)]
mod platform {
    use std::io::{self, IsTerminal};
    use std::os::fd::AsFd;

    use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, OutputFlags, SetArg, Termios};

    use super::TerminalModes;

    /// Termios-backed modes for stdin and stdout.
    ///
    /// Input gets full raw mode; output only loses post-processing so `\n`
    /// is not translated. Descriptors that are not terminals are left alone.
    #[derive(Debug, Default)]
    pub struct StdioModes;

    /// Original attributes of stdin and stdout.
    pub struct StdioSnapshot {
        input: Option<Termios>,
        output: Option<Termios>,
    }

    impl TerminalModes for StdioModes {
        type Saved = StdioSnapshot;

        fn make_raw(&mut self) -> io::Result<StdioSnapshot> {
            let stdin = io::stdin();
            let stdout = io::stdout();

            // Capture both before touching either; they are often the same tty.
            let input = if stdin.is_terminal() {
                Some(tcgetattr(stdin.as_fd())?)
            } else {
                None
            };
            let output = if stdout.is_terminal() {
                Some(tcgetattr(stdout.as_fd())?)
            } else {
                None
            };

            if let Some(original) = &input {
                let mut raw = original.clone();
                cfmakeraw(&mut raw);
                tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)?;
            }

            if output.is_some() {
                let result = tcgetattr(stdout.as_fd()).and_then(|mut current| {
                    current.output_flags.remove(OutputFlags::OPOST);
                    tcsetattr(stdout.as_fd(), SetArg::TCSANOW, &current)
                });
                if let Err(e) = result {
                    if let Some(original) = &input {
                        let _ = tcsetattr(stdin.as_fd(), SetArg::TCSANOW, original);
                    }
                    return Err(e.into());
                }
            }

            tracing::trace!(
                input = input.is_some(),
                output = output.is_some(),
                "Captured stdio terminal attributes"
            );
            Ok(StdioSnapshot { input, output })
        }

        fn apply(&mut self, saved: StdioSnapshot) -> io::Result<()> {
            // Output first: when both are the same tty the input snapshot wins.
            let output = saved
                .output
                .map(|termios| tcsetattr(io::stdout().as_fd(), SetArg::TCSANOW, &termios))
                .transpose();
            let input = saved
                .input
                .map(|termios| tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &termios))
                .transpose();

            input?;
            output?;
            Ok(())
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use std::io::{self, IsTerminal};

    use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

    use super::TerminalModes;

    /// Console modes for stdin and stdout via crossterm.
    #[derive(Debug, Default)]
    pub struct StdioModes;

    impl TerminalModes for StdioModes {
        type Saved = bool;

        fn make_raw(&mut self) -> io::Result<bool> {
            if !io::stdin().is_terminal() {
                return Ok(false);
            }
            enable_raw_mode()?;
            Ok(true)
        }

        fn apply(&mut self, saved: bool) -> io::Result<()> {
            if saved {
                disable_raw_mode()?;
            }
            Ok(())
        }
    }
}

pub use platform::StdioModes;
