//! IPC module for the control protocol
//!
//! Uses a Unix domain socket with newline-delimited JSON. The daemon listens
//! on the socket; the host network-management daemon, the tunnel helper and
//! the CLI conveniences all connect as clients.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use ssovpn_proto::{ControlRequest, ControlResponse, Notification};

/// Default control socket location, per-user runtime directory with a /tmp
/// fallback.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ssovpnd.sock")
}

/// Client side of the control protocol.
pub struct IpcClient {
    stream: BufReader<UnixStream>,
}

impl IpcClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to control socket at {:?}", path))?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send a request and receive its response.
    pub async fn request(&mut self, req: &ControlRequest) -> Result<ControlResponse> {
        let mut json = serde_json::to_string(req)?;
        json.push('\n');

        self.stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .context("Failed to send request")?;
        self.stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush request")?;

        let mut response_line = String::new();
        self.stream
            .read_line(&mut response_line)
            .await
            .context("Failed to read response")?;

        let response: ControlResponse =
            serde_json::from_str(&response_line).context("Failed to parse response")?;

        Ok(response)
    }

    /// Read the next notification on a subscribed connection.
    pub async fn next_notification(&mut self) -> Result<Notification> {
        let mut line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut line)
            .await
            .context("Failed to read notification")?;
        if bytes_read == 0 {
            anyhow::bail!("Connection closed");
        }

        let notification: Notification =
            serde_json::from_str(&line).context("Failed to parse notification")?;
        Ok(notification)
    }
}

/// Server side of the control protocol.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    pub async fn bind_to(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Take over a stale socket left by a crashed instance, but never a
        // live one.
        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => {
                    anyhow::bail!(
                        "Another supervisor is already running (socket at {:?} is active)",
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

/// A single accepted control connection.
pub struct IpcConnection {
    stream: BufReader<UnixStream>,
}

impl IpcConnection {
    /// Receive the next request. `None` when the client closed the
    /// connection.
    pub async fn recv(&mut self) -> Result<Option<ControlRequest>> {
        let mut line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut line)
            .await
            .context("Failed to read request")?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request: ControlRequest =
            serde_json::from_str(&line).context("Failed to parse request")?;
        Ok(Some(request))
    }

    pub async fn send(&mut self, response: &ControlResponse) -> Result<()> {
        self.write_line(serde_json::to_string(response)?).await
    }

    /// Push a notification on a subscribed connection.
    pub async fn notify(&mut self, notification: &Notification) -> Result<()> {
        self.write_line(serde_json::to_string(notification)?).await
    }

    async fn write_line(&mut self, mut json: String) -> Result<()> {
        json.push('\n');

        self.stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .context("Failed to send message")?;
        self.stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush message")?;

        Ok(())
    }
}
