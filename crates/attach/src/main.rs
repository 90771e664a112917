//! Dockside Attach
//!
//! Interactive exec and attach sessions into running containers.

use std::path::PathBuf;

use attach::config::Config;
use attach::engine::EngineClient;
use attach::{AttachOptions, AttachRunner, AttachTarget, LocalEngine, RunReport, SessionIo};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// Dockside Attach - interactive sessions into running containers.
#[derive(Parser, Debug)]
#[command(name = "dockside-attach")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every session command.
#[derive(Args, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Do not allocate a pseudo-terminal
    #[arg(long)]
    pub no_tty: bool,

    /// Override the detach sequence (e.g. "ctrl-a,d"; empty disables it)
    #[arg(long, value_name = "KEYS")]
    pub detach_keys: Option<String>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a command in a running container
    Exec {
        #[command(flatten)]
        session: SessionArgs,

        /// Set environment variables (KEY=VALUE)
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Working directory inside the container
        #[arg(short, long, value_name = "DIR")]
        workdir: Option<String>,

        /// Username or UID
        #[arg(short, long)]
        user: Option<String>,

        /// Container name or ID
        container: String,

        /// Command and arguments (defaults to the configured command)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },

    /// Attach to the main process of a running container
    Attach {
        #[command(flatten)]
        session: SessionArgs,

        /// Container name or ID
        container: String,
    },

    /// Run a command on this host through the local engine
    Local {
        #[command(flatten)]
        session: SessionArgs,

        /// Command and arguments (defaults to the configured command)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Every exit goes through here. Returning from main would drop the
    // runtime, which waits for any blocking task still parked on a read.
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

/// Run the selected command. Returns the process exit status.
async fn run(cli: Cli) -> anyhow::Result<i32> {
    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    let session_args = match &cli.command {
        Commands::Exec { session, .. }
        | Commands::Attach { session, .. }
        | Commands::Local { session, .. } => session.clone(),
    };
    if let Some(keys) = &session_args.detach_keys {
        config.attach.detach_keys = keys.clone();
    }

    // Validate configuration
    config.validate()?;

    let log_guard = attach::logging::init_logging(
        &config.logging.level,
        cli.verbose,
        config.logging.file.as_deref(),
    )?;
    if let Some(path) = &cli.config {
        tracing::debug!("Using config file: {:?}", path);
    }

    let options = AttachOptions {
        tty: config.attach.tty && !session_args.no_tty,
        detach_keys: config.attach.detach_key_bytes()?,
        resize: config.resize.settings(),
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let report = match cli.command {
        Commands::Exec {
            env,
            workdir,
            user,
            container,
            cmd,
            ..
        } => {
            let options = AttachOptions {
                env,
                working_dir: workdir,
                user,
                ..options
            };
            let target = AttachTarget::Exec {
                container,
                command: command_or_default(cmd, &config),
            };
            run_docker(&config, target, options, cancel).await?
        }
        Commands::Attach { container, .. } => {
            run_docker(&config, AttachTarget::Container(container), options, cancel).await?
        }
        Commands::Local { cmd, .. } => {
            let target = AttachTarget::Exec {
                container: "local".to_string(),
                command: command_or_default(cmd, &config),
            };
            run_session(LocalEngine::new(), target, options, cancel).await?
        }
    };

    if report.was_detached() {
        eprintln!("\r\nDetached. The remote process is still running.\r");
    }

    let code = exit_status(&report);
    tracing::debug!(code, "Exiting");
    drop(log_guard);
    Ok(code)
}

#[cfg(unix)]
async fn run_docker(
    config: &Config,
    target: AttachTarget,
    options: AttachOptions,
    cancel: CancellationToken,
) -> anyhow::Result<RunReport> {
    let engine = attach::DockerEngine::new(&config.engine.socket_path, &config.engine.api_version);
    run_session(engine, target, options, cancel).await
}

#[cfg(not(unix))]
async fn run_docker(
    _config: &Config,
    _target: AttachTarget,
    _options: AttachOptions,
    _cancel: CancellationToken,
) -> anyhow::Result<RunReport> {
    anyhow::bail!("The Docker engine is only reachable over a Unix socket on this platform")
}

async fn run_session<E: EngineClient>(
    engine: E,
    target: AttachTarget,
    options: AttachOptions,
    cancel: CancellationToken,
) -> anyhow::Result<RunReport> {
    let runner = AttachRunner::new(engine);
    let io = SessionIo::stdio()?;
    let report = runner.run(target, options, io, cancel).await?;
    Ok(report)
}

fn command_or_default(cmd: Vec<String>, config: &Config) -> Vec<String> {
    if cmd.is_empty() {
        config.attach.default_command.clone()
    } else {
        cmd
    }
}

/// Process exit status for a finished run.
fn exit_status(report: &RunReport) -> i32 {
    match report.exit_code {
        Some(code) if !report.detached => code.clamp(0, 255) as i32,
        _ => 0,
    }
}

/// Cancel the session on SIGTERM or SIGHUP.
#[cfg(unix)]
fn spawn_signal_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::debug!("Received SIGTERM"),
            _ = sighup.recv() => tracing::debug!("Received SIGHUP"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Received Ctrl-C");
            cancel.cancel();
        }
    });
    Ok(())
}
