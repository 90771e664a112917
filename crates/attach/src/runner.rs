//! Attach entry point.
//!
//! [`AttachRunner::run`] performs the whole interactive operation: ask the
//! engine for a hijacked connection, keep the remote terminal sized while
//! streaming, and report whether the user detached and how the remote
//! command exited.

use std::io;
use std::sync::Arc;

use protocol::{format_detach_keys, DEFAULT_DETACH_KEYS};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{EngineClient, EngineError, ExecConfig};
use crate::stream::{
    LocalInput, LocalOutput, ResizeMonitor, ResizeSettings, Resizer, SessionOutcome, StreamError,
    StreamSession,
};
use crate::terminal::{stdin_reader, LocalTerminalSize, RawTerminal, SizeSource, TerminalControl};

/// Errors from an attach run.
#[derive(Error, Debug)]
pub enum AttachError {
    /// Creating or attaching failed; nothing was streamed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The session itself failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// What to attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    /// Run `command` as a new exec inside `container`.
    Exec {
        container: String,
        command: Vec<String>,
    },
    /// Attach to the main process of a running container.
    Container(String),
}

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub tty: bool,
    pub detach_keys: Vec<u8>,
    /// `KEY=VALUE` entries for an exec.
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub resize: ResizeSettings,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            tty: true,
            detach_keys: DEFAULT_DETACH_KEYS.to_vec(),
            env: Vec::new(),
            working_dir: None,
            user: None,
            resize: ResizeSettings::default(),
        }
    }
}

/// The local side of a session.
pub struct SessionIo {
    pub input: Option<LocalInput>,
    pub output: Option<LocalOutput>,
    pub err_output: Option<LocalOutput>,
    pub terminal: Option<Arc<dyn TerminalControl>>,
    pub size: Arc<dyn SizeSource>,
}

impl SessionIo {
    /// No local streams and no terminal.
    pub fn detached() -> Self {
        Self {
            input: None,
            output: None,
            err_output: None,
            terminal: None,
            size: Arc::new(LocalTerminalSize),
        }
    }

    /// The process's own stdin, stdout, stderr and terminal.
    ///
    /// Stdin is read on its own thread; see [`stdin_reader`]. Must be called
    /// from within a tokio runtime.
    pub fn stdio() -> io::Result<Self> {
        Ok(Self {
            input: Some(Box::new(stdin_reader()?)),
            output: Some(Box::new(tokio::io::stdout())),
            err_output: Some(Box::new(tokio::io::stderr())),
            terminal: Some(Arc::new(RawTerminal::stdio())),
            size: Arc::new(LocalTerminalSize),
        })
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub detached: bool,
    /// Exit code of the exec, when it finished and the engine reported one.
    pub exit_code: Option<i64>,
}

impl RunReport {
    pub fn was_detached(&self) -> bool {
        self.detached
    }
}

#[derive(Debug, Clone)]
enum ResizeTarget {
    Exec(String),
    Container(String),
}

struct EngineResizer<E> {
    engine: Arc<E>,
    target: ResizeTarget,
}

impl<E: EngineClient> Resizer for EngineResizer<E> {
    async fn resize(&self, height: u16, width: u16) -> anyhow::Result<()> {
        match &self.target {
            ResizeTarget::Exec(id) => self.engine.resize_exec(id, height, width).await?,
            ResizeTarget::Container(id) => self.engine.resize_container(id, height, width).await?,
        }
        Ok(())
    }
}

/// Runs interactive sessions against an engine.
pub struct AttachRunner<E> {
    engine: Arc<E>,
}

impl<E> Clone for AttachRunner<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<E: EngineClient> AttachRunner<E> {
    pub fn new(engine: E) -> Self {
        Self::from_arc(Arc::new(engine))
    }

    pub fn from_arc(engine: Arc<E>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Create (for an exec), attach and stream until the session ends.
    ///
    /// Engine failures happen before anything is streamed. The exit code is
    /// only looked up for an exec that completed without detaching.
    pub async fn run(
        &self,
        target: AttachTarget,
        options: AttachOptions,
        io: SessionIo,
        cancel: CancellationToken,
    ) -> Result<RunReport, AttachError> {
        let notation = format_detach_keys(&options.detach_keys);

        let (transport, resize_target) = match target {
            AttachTarget::Exec { container, command } => {
                let config = ExecConfig {
                    cmd: command,
                    env: options.env.clone(),
                    working_dir: options.working_dir.clone(),
                    user: options.user.clone(),
                    tty: options.tty,
                    detach_keys: (!notation.is_empty()).then(|| notation.clone()),
                };
                let exec_id = self.engine.create_exec(&container, &config).await?;
                let transport = self.engine.attach_exec(&exec_id, options.tty).await?;
                debug!(container = %container, exec_id = %exec_id, tty = options.tty, "Attached to exec");
                (transport, ResizeTarget::Exec(exec_id))
            }
            AttachTarget::Container(container) => {
                let transport = self
                    .engine
                    .attach_container(&container, options.tty, &notation)
                    .await?;
                debug!(container = %container, tty = options.tty, "Attached to container");
                (transport, ResizeTarget::Container(container))
            }
        };

        // The monitor never outlives this call.
        let monitor_cancel = cancel.child_token();
        let _monitor_guard = monitor_cancel.clone().drop_guard();
        if options.tty {
            let resizer = EngineResizer {
                engine: Arc::clone(&self.engine),
                target: resize_target.clone(),
            };
            ResizeMonitor::new(resizer)
                .with_source(io.size)
                .with_settings(options.resize)
                .spawn(monitor_cancel.clone());
        }

        let mut session = StreamSession::new(transport)
            .tty(options.tty)
            .detach_keys(options.detach_keys);
        if let Some(input) = io.input {
            session = session.input(input);
        }
        if let Some(output) = io.output {
            session = session.output(output);
        }
        if let Some(err_output) = io.err_output {
            session = session.err_output(err_output);
        }
        if let Some(terminal) = io.terminal {
            session = session.terminal(terminal);
        }

        let outcome = session.stream(cancel).await?;
        let detached = outcome == SessionOutcome::Detached;

        let exit_code = match (&resize_target, detached) {
            (ResizeTarget::Exec(exec_id), false) => {
                match self.engine.exec_exit_code(exec_id).await {
                    Ok(code) => code,
                    Err(e) => {
                        warn!(exec_id = %exec_id, error = %e, "Could not read exec exit code");
                        None
                    }
                }
            }
            _ => None,
        };

        debug!(detached, ?exit_code, "Run finished");
        Ok(RunReport {
            detached,
            exit_code,
        })
    }
}
