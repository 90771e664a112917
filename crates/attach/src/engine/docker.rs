//! Docker Engine API client.
//!
//! Each call opens a fresh HTTP/1.1 connection to the daemon's Unix socket.
//! Exec start and container attach ask the daemon to upgrade the connection
//! and hand the raw upgraded stream to the session as its transport.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tracing::{debug, trace};
use url::form_urlencoded;

use super::{EngineClient, EngineError, ExecConfig, Result};
use crate::stream::Transport;

/// Default Docker daemon socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Default API version prefix.
pub const DEFAULT_API_VERSION: &str = "v1.43";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExecCreateRequest<'a> {
    attach_stdin: bool,
    attach_stdout: bool,
    attach_stderr: bool,
    tty: bool,
    cmd: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detach_keys: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecCreateResponse {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExecStartRequest {
    detach: bool,
    tty: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecInspect {
    running: bool,
    exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

/// Docker Engine API over a Unix socket.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    socket_path: PathBuf,
    api_version: String,
}

impl DockerEngine {
    /// Client for the daemon listening on `socket_path`.
    pub fn new(socket_path: impl AsRef<Path>, api_version: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            api_version: api_version.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn path(&self, rest: &str) -> String {
        format!("/{}{}", self.api_version, rest)
    }

    /// Send a request and return the body of a successful response.
    async fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
        let mut sender = self.handshake(false).await?;
        let request = build_request(method, path, body, false)?;

        trace!(path, "Engine request");
        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok(body)
    }

    /// Send an upgrade request and return the hijacked connection.
    async fn upgrade(&self, path: &str, body: Option<Vec<u8>>) -> Result<Transport> {
        let mut sender = self.handshake(true).await?;
        let request = build_request(Method::POST, path, body, true)?;

        trace!(path, "Engine upgrade request");
        let response = sender.send_request(request).await?;
        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(status_error(status, &body));
        }

        let upgraded = hyper::upgrade::on(response).await?;
        debug!(path, "Connection upgraded");
        Ok(Transport::from_duplex(TokioIo::new(upgraded)))
    }

    async fn handshake(&self, upgrades: bool) -> Result<SendRequest<Full<Bytes>>> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| EngineError::Connect {
                path: self.socket_path.display().to_string(),
                source,
            })?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

        // The connection task must keep running for the request (and any
        // upgrade) to make progress.
        if upgrades {
            tokio::spawn(async move {
                if let Err(e) = conn.with_upgrades().await {
                    debug!(error = %e, "Engine upgrade connection ended");
                }
            });
        } else {
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "Engine connection ended");
                }
            });
        }

        Ok(sender)
    }
}

impl EngineClient for DockerEngine {
    async fn create_exec(&self, container: &str, config: &ExecConfig) -> Result<String> {
        let request = ExecCreateRequest {
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            tty: config.tty,
            cmd: &config.cmd,
            env: (!config.env.is_empty()).then_some(config.env.as_slice()),
            working_dir: config.working_dir.as_deref(),
            user: config.user.as_deref(),
            detach_keys: config.detach_keys.as_deref(),
        };
        let body = serde_json::to_vec(&request)?;
        let path = self.path(&format!("/containers/{}/exec", container));

        let response = self.request(Method::POST, &path, Some(body)).await?;
        let created: ExecCreateResponse = serde_json::from_slice(&response)?;
        debug!(container, exec_id = %created.id, "Created exec");
        Ok(created.id)
    }

    async fn attach_exec(&self, exec_id: &str, tty: bool) -> Result<Transport> {
        let body = serde_json::to_vec(&ExecStartRequest { detach: false, tty })?;
        let path = self.path(&format!("/exec/{}/start", exec_id));
        self.upgrade(&path, Some(body)).await
    }

    async fn attach_container(
        &self,
        container: &str,
        tty: bool,
        detach_keys: &str,
    ) -> Result<Transport> {
        let path = self.path(&format!(
            "/containers/{}/attach?{}",
            container,
            attach_query(detach_keys)
        ));
        debug!(container, tty, "Attaching to container");
        self.upgrade(&path, None).await
    }

    async fn resize_exec(&self, exec_id: &str, height: u16, width: u16) -> Result<()> {
        let path = self.path(&format!("/exec/{}/resize?{}", exec_id, resize_query(height, width)));
        self.request(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn resize_container(&self, container: &str, height: u16, width: u16) -> Result<()> {
        let path = self.path(&format!(
            "/containers/{}/resize?{}",
            container,
            resize_query(height, width)
        ));
        self.request(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let path = self.path(&format!("/exec/{}/json", exec_id));
        let body = self.request(Method::GET, &path, None).await?;
        let inspect: ExecInspect = serde_json::from_slice(&body)?;
        Ok(if inspect.running { None } else { inspect.exit_code })
    }
}

fn build_request(
    method: Method,
    path: &str,
    body: Option<Vec<u8>>,
    upgrade: bool,
) -> Result<Request<Full<Bytes>>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(format!("http://localhost{}", path))
        .header(HOST, "localhost");

    if upgrade {
        builder = builder.header(CONNECTION, "Upgrade").header(UPGRADE, "tcp");
    }

    let request = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?,
        None => builder.body(Full::new(Bytes::new()))?,
    };
    Ok(request)
}

fn attach_query(detach_keys: &str) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("stream", "1")
        .append_pair("stdin", "1")
        .append_pair("stdout", "1")
        .append_pair("stderr", "1");
    if !detach_keys.is_empty() {
        query.append_pair("detachKeys", detach_keys);
    }
    query.finish()
}

fn resize_query(height: u16, width: u16) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair("h", &height.to_string())
        .append_pair("w", &width.to_string())
        .finish()
}

/// Map an error response to an [`EngineError`], preferring the daemon's
/// own message.
fn status_error(status: StatusCode, body: &[u8]) -> EngineError {
    let message = serde_json::from_slice::<ErrorResponse>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());

    if status == StatusCode::NOT_FOUND {
        EngineError::NotFound(message)
    } else {
        EngineError::Status {
            status: status.as_u16(),
            message,
        }
    }
}
