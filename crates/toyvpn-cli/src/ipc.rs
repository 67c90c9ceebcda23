//! Daemon control socket
//!
//! The daemon listens on a Unix domain socket and the CLI connects to it to
//! start or stop the tunnel and to query status. Each message is one line of
//! JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::service::ServiceStatus;

/// IPC request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Start (or restart) the tunnel with the stored profile
    Connect,

    /// Tear the tunnel down
    Disconnect,

    /// Get the link status
    Status,

    /// Ping to check if daemon is alive
    Ping,

    /// Stop the tunnel and exit
    Shutdown,
}

/// IPC response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Success acknowledgment
    Ok { message: Option<String> },

    /// Link status
    Status { status: ServiceStatus },

    /// Error response
    Error { message: String },

    /// Pong response to ping
    Pong,
}

async fn write_line<T: Serialize>(stream: &mut BufReader<UnixStream>, value: &T) -> Result<()> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');

    stream
        .get_mut()
        .write_all(json.as_bytes())
        .await
        .context("Failed to send message")?;
    stream
        .get_mut()
        .flush()
        .await
        .context("Failed to flush message")?;
    Ok(())
}

/// IPC client for CLI to connect to daemon
pub struct IpcClient {
    stream: BufReader<UnixStream>,
}

impl IpcClient {
    /// Connect to the daemon socket at `path`
    pub async fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to daemon socket at {:?}", path))?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send a request and receive a response
    pub async fn request(&mut self, req: &IpcRequest) -> Result<IpcResponse> {
        write_line(&mut self.stream, req).await?;

        let mut response_line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut response_line)
            .await
            .context("Failed to read response")?;
        if bytes_read == 0 {
            anyhow::bail!("Daemon closed the connection");
        }

        let response: IpcResponse =
            serde_json::from_str(&response_line).context("Failed to parse response")?;
        Ok(response)
    }
}

/// IPC server for daemon to listen for CLI connections
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind to the socket at `path`, replacing a stale socket file
    pub async fn bind_to(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => {
                    anyhow::bail!(
                        "Another daemon is already running (socket at {:?} is active)",
                        path
                    );
                }
                Err(_) => {
                    std::fs::remove_file(path)?;
                }
            }
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind to socket at {:?}", path))?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<IpcConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcConnection {
            stream: BufReader::new(stream),
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// A single IPC connection from a client
pub struct IpcConnection {
    stream: BufReader<UnixStream>,
}

impl IpcConnection {
    /// Receive the next request; `None` once the client hangs up
    pub async fn recv(&mut self) -> Result<Option<IpcRequest>> {
        let mut line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut line)
            .await
            .context("Failed to read request")?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request: IpcRequest = serde_json::from_str(&line).context("Failed to parse request")?;
        Ok(Some(request))
    }

    /// Send a response to the client
    pub async fn send(&mut self, response: &IpcResponse) -> Result<()> {
        write_line(&mut self.stream, response).await
    }
}
