//! # Dockside Attach Library
//!
//! This crate provides the interactive session behind Dockside's "exec into
//! container" and "attach to container" actions.
//!
//! ## Overview
//!
//! A session connects the user's terminal to a process running inside a
//! container:
//!
//! - **Stream Session**: Copy keyboard input to the remote process and its
//!   output back to the screen until either side finishes
//! - **Detach Keys**: Recognise an in-band key sequence that ends the view
//!   while the remote process keeps running
//! - **Raw Mode**: Put the local terminal into raw mode and always restore it
//! - **Resize Sync**: Keep the remote pseudo-terminal the size of the local one
//! - **Engines**: The Docker Engine API over its Unix socket, or local
//!   processes for testing without a daemon
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Attach Runner                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │    Input     │  │    Output    │  │       Resize         │  │
//! │  │  (detach)    │  │   (demux)    │  │      Monitor         │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                Hijacked engine transport                   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌───────────────────┐  ┌───────────────────────────────────┐  │
//! │  │   DockerEngine    │  │           LocalEngine             │  │
//! │  └───────────────────┘  └───────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use attach::{AttachOptions, AttachRunner, AttachTarget, LocalEngine, SessionIo};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runner = AttachRunner::new(LocalEngine::new());
//!     let target = AttachTarget::Exec {
//!         container: "local".to_string(),
//!         command: vec!["/bin/sh".to_string()],
//!     };
//!
//!     let report = runner
//!         .run(target, AttachOptions::default(), SessionIo::stdio()?, CancellationToken::new())
//!         .await?;
//!     println!("exit code: {:?}", report.exit_code);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`engine`]: Engine clients
//! - [`logging`]: Tracing subscriber setup
//! - [`runner`]: Create, attach, stream and report
//! - [`stream`]: Session copy tasks, detach filtering, resize monitoring
//! - [`terminal`]: Raw mode and local terminal size

pub mod config;
pub mod engine;
pub mod logging;
pub mod runner;
pub mod stream;
pub mod terminal;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

#[cfg(unix)]
pub use engine::DockerEngine;
pub use engine::{EngineClient, EngineError, ExecConfig, LocalEngine};

pub use runner::{AttachError, AttachOptions, AttachRunner, AttachTarget, RunReport, SessionIo};

pub use stream::{
    ResizeMonitor, ResizeSettings, SessionOutcome, StreamError, StreamSession, Transport,
};

pub use terminal::{RawTerminal, TerminalControl, TerminalModes};
