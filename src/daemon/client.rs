use super::protocol::{ClientMessage, RequestEnvelope, ResponseEnvelope};
use super::transport::{FramedReader, FramedWriter};
use crate::clienv;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{ReadHalf, WriteHalf};
use tracing::trace;

#[cfg(unix)]
type Stream = tokio::net::UnixStream;
#[cfg(not(unix))]
type Stream = tokio::net::TcpStream;

/// Talks to a running daemon over its local socket.
pub struct DaemonClient {
    socket_path: PathBuf,
    next_id: AtomicU64,
}

impl DaemonClient {
    pub fn new() -> Self {
        Self::with_socket(clienv::daemon_socket_path())
    }

    pub fn with_socket(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn connect(&self) -> Result<Stream> {
        #[cfg(unix)]
        let stream = tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!("Failed to connect to daemon at {}", self.socket_path.display())
            })?;

        #[cfg(not(unix))]
        let stream = {
            let port = clienv::daemon_tcp_port();
            tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
                .await
                .with_context(|| format!("Failed to connect to daemon on port {}", port))?
        };

        Ok(stream)
    }

    /// Send a request and return its envelope stream.
    pub async fn request(&self, path: &str, data: Value) -> Result<ClientStream> {
        let stream = self.connect().await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = FramedWriter::length_prefixed(write_half);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RequestEnvelope::new(path).id(id).data(data);
        trace!(id, path, "Sending request");
        writer
            .send(&ClientMessage::Request(request))
            .await
            .context("Failed to send request")?;

        Ok(ClientStream {
            id,
            reader: FramedReader::length_prefixed(read_half),
            writer,
            done: false,
        })
    }

    /// Send a request and wait for its final envelope.
    pub async fn call(&self, path: &str, data: Value) -> Result<ResponseEnvelope> {
        let mut stream = self.request(path, data).await?;
        let mut last = None;
        while let Some(envelope) = stream.next().await? {
            last = Some(envelope);
        }
        last.context("Daemon sent no response")
    }

    pub async fn is_running(&self) -> bool {
        self.status().await.is_ok()
    }

    pub async fn status(&self) -> Result<Value> {
        let envelope = self.call("/daemon/status", Value::Null).await?;
        if envelope.is_error() {
            anyhow::bail!("Daemon status failed: {}", envelope.message);
        }
        Ok(envelope.message)
    }

    pub async fn shutdown(&self) -> Result<()> {
        let envelope = self.call("/daemon/shutdown", Value::Null).await?;
        if envelope.is_error() {
            anyhow::bail!("Daemon refused to shut down: {}", envelope.message);
        }
        Ok(())
    }
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Responses to one request, in the order the daemon sent them.
pub struct ClientStream {
    id: u64,
    reader: FramedReader<ReadHalf<Stream>>,
    writer: FramedWriter<WriteHalf<Stream>>,
    done: bool,
}

impl ClientStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next envelope; `None` after the `fin` envelope.
    pub async fn next(&mut self) -> Result<Option<ResponseEnvelope>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let envelope: ResponseEnvelope = self
                .reader
                .next()
                .await
                .context("Failed to read response")?
                .context("Daemon closed the connection before the response finished")?;
            if envelope.id.is_some_and(|id| id != self.id) {
                continue;
            }
            if envelope.fin {
                self.done = true;
            }
            return Ok(Some(envelope));
        }
    }

    /// Ask the daemon to stop streaming this request. `next` returns `None`
    /// afterwards.
    pub async fn cancel(&mut self) -> Result<()> {
        if !self.done {
            self.done = true;
            self.writer
                .send(&ClientMessage::Cancel { id: self.id })
                .await
                .context("Failed to send cancel")?;
        }
        Ok(())
    }
}
