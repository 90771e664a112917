//! Container engine access.
//!
//! Sessions only need a handful of engine operations: create an exec, hijack
//! its stdio, resize its terminal and read its exit code. [`EngineClient`]
//! is that contract. [`DockerEngine`] speaks the Docker Engine API over its
//! Unix socket; [`LocalEngine`] runs commands on this host and is what
//! `dockside-attach local` and the integration tests use.

#[cfg(unix)]
pub mod docker;
pub mod local;

use std::future::Future;
use std::io;

use thiserror::Error;

use crate::stream::Transport;

#[cfg(unix)]
pub use docker::DockerEngine;
pub use local::LocalEngine;

/// Errors returned by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Could not reach the engine.
    #[error("failed to connect to engine at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: io::Error,
    },

    /// HTTP protocol failure.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// A request could not be built.
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    /// The engine answered with an error status.
    #[error("engine returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The container or exec does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A response body could not be decoded.
    #[error("invalid response: {0}")]
    Json(#[from] serde_json::Error),

    /// The process could not be started.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// The engine does not support this operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Parameters for a new exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecConfig {
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// Allocate a pseudo-terminal.
    pub tty: bool,
    /// Detach sequence in `ctrl-p,ctrl-q` notation, passed to the engine.
    pub detach_keys: Option<String>,
}

impl ExecConfig {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            ..Default::default()
        }
    }
}

/// The engine operations an interactive session depends on.
pub trait EngineClient: Send + Sync + 'static {
    /// Register an exec in `container`. Returns the exec id.
    fn create_exec(
        &self,
        container: &str,
        config: &ExecConfig,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Start the exec and hijack its stdio.
    fn attach_exec(&self, exec_id: &str, tty: bool) -> impl Future<Output = Result<Transport>> + Send;

    /// Attach to the main process of a running container.
    fn attach_container(
        &self,
        container: &str,
        tty: bool,
        detach_keys: &str,
    ) -> impl Future<Output = Result<Transport>> + Send;

    fn resize_exec(
        &self,
        exec_id: &str,
        height: u16,
        width: u16,
    ) -> impl Future<Output = Result<()>> + Send;

    fn resize_container(
        &self,
        container: &str,
        height: u16,
        width: u16,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Exit code of a finished exec, `None` while it is still running.
    fn exec_exit_code(&self, exec_id: &str) -> impl Future<Output = Result<Option<i64>>> + Send;
}
