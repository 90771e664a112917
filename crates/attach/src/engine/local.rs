//! Local process engine.
//!
//! Runs exec commands on this host instead of inside a container. A tty exec
//! gets a real pseudo-terminal; a non-tty exec gets piped stdio whose output
//! is framed the same way the Docker daemon frames it, so sessions cannot
//! tell the two engines apart.

use std::io::{Read, Write};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use dashmap::DashMap;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::{encode_frame, StreamKind};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{EngineClient, EngineError, ExecConfig, Result};
use crate::stream::Transport;

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the in-memory pipe between the process and the session.
const BRIDGE_CAPACITY: usize = 64 * 1024;

/// Chunks queued between the blocking pty threads and the async side.
const CHANNEL_CAPACITY: usize = 64;

/// Size of a freshly opened pty, before the first resize.
const INITIAL_PTY_SIZE: PtySize = PtySize {
    rows: 24,
    cols: 80,
    pixel_width: 0,
    pixel_height: 0,
};

type SharedMaster = Arc<Mutex<Box<dyn MasterPty + Send>>>;

/// Dropping the last handle sends end-of-file to the pty, so one is kept
/// with the exec until it exits.
type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

struct ExecEntry {
    container: String,
    config: ExecConfig,
    started: bool,
    master: Option<SharedMaster>,
    writer: Option<SharedWriter>,
    exit_code: Option<i64>,
}

/// Engine that runs exec commands as local processes.
#[derive(Clone, Default)]
pub struct LocalEngine {
    execs: Arc<DashMap<String, ExecEntry>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of execs currently tracked.
    ///
    /// An exec is forgotten once its exit code has been read.
    pub fn exec_count(&self) -> usize {
        self.execs.len()
    }

    /// IDs of the execs currently tracked.
    pub fn exec_ids(&self) -> Vec<String> {
        self.execs.iter().map(|entry| entry.key().clone()).collect()
    }

    fn record_exit(&self, exec_id: &str, code: i64) {
        if let Some(mut entry) = self.execs.get_mut(exec_id) {
            entry.exit_code = Some(code);
            entry.master = None;
            entry.writer = None;
        }
        debug!(exec_id, code, "Exec exited");
    }

    fn spawn_pty(&self, exec_id: &str, config: &ExecConfig) -> Result<Transport> {
        let pair = native_pty_system()
            .openpty(INITIAL_PTY_SIZE)
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.cmd[0]);
        cmd.args(&config.cmd[1..]);
        for (key, value) in parse_env(&config.env) {
            cmd.env(key, value);
        }
        if let Some(dir) = &config.working_dir {
            cmd.cwd(dir);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        // Only the child may hold the slave, or the reader never sees EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        let writer: SharedWriter = Arc::new(Mutex::new(
            pair.master
                .take_writer()
                .map_err(|e| EngineError::Spawn(e.to_string()))?,
        ));

        // The exec keeps its terminal open after the session lets go of it.
        if let Some(mut entry) = self.execs.get_mut(exec_id) {
            entry.master = Some(Arc::new(Mutex::new(pair.master)));
            entry.writer = Some(writer.clone());
        }

        let (client, bridge) = duplex(BRIDGE_CAPACITY);
        let (bridge_read, bridge_write) = tokio::io::split(bridge);

        let (exit_tx, exit_rx) = oneshot::channel();
        spawn_thread("pty-wait", move || {
            let code = match child.wait() {
                Ok(status) => i64::from(status.exit_code()),
                Err(e) => {
                    warn!(error = %e, "Failed to wait for pty child");
                    -1
                }
            };
            let _ = exit_tx.send(code);
        })?;

        let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);
        spawn_thread("pty-read", move || pty_read_loop(reader, output_tx))?;

        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
        spawn_thread("pty-write", move || pty_write_loop(writer, input_rx))?;

        tokio::spawn(forward_input(bridge_read, input_tx));
        tokio::spawn(self.clone().finish_output(
            exec_id.to_string(),
            output_rx,
            exit_rx,
            bridge_write,
        ));

        Ok(Transport::from_duplex(client))
    }

    fn spawn_piped(&self, exec_id: &str, config: &ExecConfig) -> Result<Transport> {
        let mut command = Command::new(&config.cmd[0]);
        command
            .args(&config.cmd[1..])
            .envs(parse_env(&config.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{}: {}", config.cmd[0], e)))?;
        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(EngineError::Spawn("child stdio was not captured".to_string()));
        };

        let (client, bridge) = duplex(BRIDGE_CAPACITY);
        let (mut bridge_read, bridge_write) = tokio::io::split(bridge);

        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut bridge_read, &mut stdin).await {
                debug!(error = %e, "Process stdin closed");
            }
            // Dropping stdin closes the pipe.
        });

        let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(frame_output(stdout, StreamKind::Stdout, output_tx.clone()));
        tokio::spawn(frame_output(stderr, StreamKind::Stderr, output_tx));

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status_code(status),
                Err(e) => {
                    warn!(error = %e, "Failed to wait for process");
                    -1
                }
            };
            let _ = exit_tx.send(code);
        });

        tokio::spawn(self.clone().finish_output(
            exec_id.to_string(),
            output_rx,
            exit_rx,
            bridge_write,
        ));

        Ok(Transport::from_duplex(client))
    }

    /// Drain process output into the session, then record the exit code
    /// before signalling end of output.
    async fn finish_output<W>(
        self,
        exec_id: String,
        mut output: mpsc::Receiver<Vec<u8>>,
        exit: oneshot::Receiver<i64>,
        mut bridge: W,
    ) where
        W: AsyncWrite + Unpin,
    {
        let mut session_gone = false;
        while let Some(chunk) = output.recv().await {
            if session_gone {
                continue;
            }
            if let Err(e) = bridge.write_all(&chunk).await {
                trace!(exec_id = %exec_id, error = %e, "Session stopped reading output");
                session_gone = true;
            }
        }

        let code = exit.await.unwrap_or(-1);
        self.record_exit(&exec_id, code);
        let _ = bridge.shutdown().await;
    }
}

impl EngineClient for LocalEngine {
    async fn create_exec(&self, container: &str, config: &ExecConfig) -> Result<String> {
        let mut config = config.clone();
        if config.cmd.is_empty() {
            config.cmd = vec![default_shell()];
        }

        let exec_id = Uuid::new_v4().simple().to_string();
        debug!(container, exec_id = %exec_id, cmd = ?config.cmd, "Created local exec");
        self.execs.insert(
            exec_id.clone(),
            ExecEntry {
                container: container.to_string(),
                config,
                started: false,
                master: None,
                writer: None,
                exit_code: None,
            },
        );
        Ok(exec_id)
    }

    async fn attach_exec(&self, exec_id: &str, tty: bool) -> Result<Transport> {
        let (container, config) = {
            let mut entry = self
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| EngineError::NotFound(format!("no such exec: {}", exec_id)))?;
            if entry.started {
                return Err(EngineError::Status {
                    status: 409,
                    message: format!("exec {} has already started", exec_id),
                });
            }
            entry.started = true;
            (entry.container.clone(), entry.config.clone())
        };

        if let Some(user) = &config.user {
            debug!(exec_id, user = %user, "Ignoring user for local exec");
        }
        debug!(exec_id, container = %container, tty, "Starting local exec");

        if tty {
            self.spawn_pty(exec_id, &config)
        } else {
            self.spawn_piped(exec_id, &config)
        }
    }

    async fn attach_container(
        &self,
        _container: &str,
        _tty: bool,
        _detach_keys: &str,
    ) -> Result<Transport> {
        Err(EngineError::Unsupported("container attach on the local engine"))
    }

    async fn resize_exec(&self, exec_id: &str, height: u16, width: u16) -> Result<()> {
        let master = {
            let entry = self
                .execs
                .get(exec_id)
                .ok_or_else(|| EngineError::NotFound(format!("no such exec: {}", exec_id)))?;
            entry.master.clone()
        };
        let Some(master) = master else {
            return Err(EngineError::Status {
                status: 409,
                message: format!("exec {} has no running terminal", exec_id),
            });
        };

        let master = master.lock().unwrap_or_else(PoisonError::into_inner);
        master
            .resize(PtySize {
                rows: height,
                cols: width,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))?;

        debug!(exec_id, height, width, "Resized local pty");
        Ok(())
    }

    async fn resize_container(&self, _container: &str, _height: u16, _width: u16) -> Result<()> {
        Err(EngineError::Unsupported("container resize on the local engine"))
    }

    /// Reading the code of a finished exec also forgets it.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let code = self
            .execs
            .get(exec_id)
            .map(|entry| entry.exit_code)
            .ok_or_else(|| EngineError::NotFound(format!("no such exec: {}", exec_id)))?;
        // The read guard above is released before removing.
        if code.is_some() {
            self.execs.remove(exec_id);
            trace!(exec_id, "Forgot finished exec");
        }
        Ok(code)
    }
}

fn spawn_thread<F>(name: &str, f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(|e| EngineError::Spawn(e.to_string()))
}

fn pty_read_loop(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Vec<u8>>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if output.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            // Linux reports EIO once the child side of the pty is gone.
            Err(e) => {
                trace!(error = %e, "Pty read ended");
                break;
            }
        }
    }
}

fn pty_write_loop(writer: SharedWriter, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = input.blocking_recv() {
        let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
            debug!(error = %e, "Pty write failed");
            break;
        }
    }
}

async fn forward_input<R>(mut bridge: R, input: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match bridge.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if input.send(buffer[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn frame_output<R>(mut pipe: R, kind: StreamKind, output: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match pipe.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if output.send(encode_frame(kind, &buffer[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(?kind, error = %e, "Process output closed");
                break;
            }
        }
    }
}

/// Split `KEY=VALUE` entries. An entry without `=` sets an empty value.
fn parse_env(env: &[String]) -> Vec<(String, String)> {
    env.iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect()
}

/// Shell used when an exec has no command: `$SHELL`, then `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(unix)]
fn status_code(status: ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => i64::from(code),
        (None, Some(signal)) => 128 + i64::from(signal),
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn status_code(status: ExitStatus) -> i64 {
    status.code().map(i64::from).unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        let env = vec!["A=1".to_string(), "B=x=y".to_string(), "C".to_string()];
        assert_eq!(
            parse_env(&env),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string()),
                ("C".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_default_shell_not_empty() {
        assert!(!default_shell().is_empty());
    }

    #[tokio::test]
    async fn test_create_exec_defaults_command() {
        let engine = LocalEngine::new();
        let exec_id = engine
            .create_exec("host", &ExecConfig::default())
            .await
            .unwrap();

        assert_eq!(engine.exec_count(), 1);
        let entry = engine.execs.get(&exec_id).unwrap();
        assert_eq!(entry.config.cmd.len(), 1);
        assert_eq!(entry.container, "host");
    }

    #[tokio::test]
    async fn test_unknown_exec_is_not_found() {
        let engine = LocalEngine::new();
        assert!(matches!(
            engine.attach_exec("missing", false).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.exec_exit_code("missing").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.resize_exec("missing", 24, 80).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_container_operations_unsupported() {
        let engine = LocalEngine::new();
        assert!(matches!(
            engine.attach_container("web", true, "ctrl-p,ctrl-q").await,
            Err(EngineError::Unsupported(_))
        ));
        assert!(matches!(
            engine.resize_container("web", 24, 80).await,
            Err(EngineError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_starts_once() {
        let engine = LocalEngine::new();
        let config = ExecConfig::new(vec!["true".to_string()]);
        let exec_id = engine.create_exec("host", &config).await.unwrap();

        let _transport = engine.attach_exec(&exec_id, false).await.unwrap();
        assert!(matches!(
            engine.attach_exec(&exec_id, false).await,
            Err(EngineError::Status { status: 409, .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let engine = LocalEngine::new();
        let config = ExecConfig::new(vec!["/definitely/not/a/program".to_string()]);
        let exec_id = engine.create_exec("host", &config).await.unwrap();

        assert!(matches!(
            engine.attach_exec(&exec_id, false).await,
            Err(EngineError::Spawn(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_piped_exec_frames_output() {
        let engine = LocalEngine::new();
        let config = ExecConfig::new(vec!["sh".into(), "-c".into(), "printf out".into()]);
        let exec_id = engine.create_exec("host", &config).await.unwrap();

        let mut transport = engine.attach_exec(&exec_id, false).await.unwrap();
        let mut received = Vec::new();
        transport.reader.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, encode_frame(StreamKind::Stdout, b"out"));
        assert_eq!(engine.exec_exit_code(&exec_id).await.unwrap(), Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_finished_exec_is_forgotten_after_exit_code_read() {
        let engine = LocalEngine::new();
        let config = ExecConfig::new(vec!["true".to_string()]);
        let exec_id = engine.create_exec("host", &config).await.unwrap();

        let mut transport = engine.attach_exec(&exec_id, false).await.unwrap();
        let mut received = Vec::new();
        transport.reader.read_to_end(&mut received).await.unwrap();

        assert_eq!(engine.exec_ids(), vec![exec_id.clone()]);
        assert_eq!(engine.exec_exit_code(&exec_id).await.unwrap(), Some(0));
        assert_eq!(engine.exec_count(), 0);
        assert!(matches!(
            engine.exec_exit_code(&exec_id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_running_exec_is_kept_after_exit_code_read() {
        let engine = LocalEngine::new();
        let exec_id = engine
            .create_exec("host", &ExecConfig::new(vec!["true".to_string()]))
            .await
            .unwrap();

        assert_eq!(engine.exec_exit_code(&exec_id).await.unwrap(), None);
        assert_eq!(engine.exec_count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_exec_survives_session_close() {
        let engine = LocalEngine::new();
        let config = ExecConfig::new(vec![
            "sh".into(),
            "-c".into(),
            "cat; echo cat-ended".into(),
        ]);
        let exec_id = engine.create_exec("host", &config).await.unwrap();

        let mut transport = engine.attach_exec(&exec_id, true).await.unwrap();
        transport.writer.shutdown().await.unwrap();
        drop(transport);

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert_eq!(engine.exec_exit_code(&exec_id).await.unwrap(), None);
        assert!(engine.execs.get(&exec_id).unwrap().writer.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_resize() {
        let engine = LocalEngine::new();
        let config = ExecConfig::new(vec!["sh".into(), "-c".into(), "sleep 2".into()]);
        let exec_id = engine.create_exec("host", &config).await.unwrap();

        let _transport = engine.attach_exec(&exec_id, true).await.unwrap();
        engine.resize_exec(&exec_id, 40, 120).await.unwrap();
        assert_eq!(engine.exec_exit_code(&exec_id).await.unwrap(), None);
    }
}
