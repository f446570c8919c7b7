use super::dispatcher::{Dispatcher, ResponseStream};
use super::protocol::{ClientMessage, ResponseEnvelope};
use super::transport::{FramedReader, FramedWriter};
use crate::config::DaemonConfig;
use crate::plugin::{InternalRegistry, Supervisor};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Frames queued per connection before request relays wait on the socket.
const OUTBOUND_CAPACITY: usize = 256;

pub struct DaemonServer {
    config: DaemonConfig,
    socket_path: PathBuf,
    pid_path: PathBuf,
    dispatcher: Arc<Dispatcher>,
}

impl DaemonServer {
    pub fn new(config: DaemonConfig, internal: InternalRegistry) -> Self {
        let mut supervisor_config = config.supervisor_config();
        supervisor_config.internal = internal;
        let supervisor = Arc::new(Supervisor::new(supervisor_config));

        let effective = serde_json::to_value(&config).unwrap_or_default();
        let dispatcher = Arc::new(Dispatcher::new(supervisor).with_config(effective));

        Self {
            socket_path: config.socket_path(),
            pid_path: config.pid_path(),
            config,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn run(self) -> Result<()> {
        info!("plugind starting...");

        if let Some(pid) = running_pid(&self.pid_path) {
            anyhow::bail!("Daemon already running with PID {}", pid);
        }
        if let Some(parent) = self.pid_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.pid_path, std::process::id().to_string())
            .with_context(|| format!("Failed to write PID file {}", self.pid_path.display()))?;
        info!("PID file written: {}", self.pid_path.display());

        let report = self
            .dispatcher
            .supervisor()
            .discover(&self.config.plugin_paths)
            .await;
        for err in &report.errors {
            warn!("Plugin discovery: {}", err);
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        let listener = tokio::net::UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;

        #[cfg(not(unix))]
        let listener = {
            let port = crate::clienv::daemon_tcp_port();
            tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?
        };

        info!("IPC server listening on: {}", self.socket_path.display());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        self.watch_signals()?;

        let mut shutdown = self.dispatcher.shutdown_signal();
        info!("plugind ready");

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(dispatcher, stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        info!("Stopping all plugins...");
        self.dispatcher.supervisor().shutdown().await;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if self.pid_path.exists() {
            std::fs::remove_file(&self.pid_path)?;
        }

        info!("plugind stopped");
        Ok(())
    }

    fn watch_signals(&self) -> Result<()> {
        let dispatcher = Arc::clone(&self.dispatcher);

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                dispatcher.request_shutdown();
            });
        }

        #[cfg(not(unix))]
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received Ctrl+C");
            dispatcher.request_shutdown();
        });

        Ok(())
    }
}

/// Serve one client connection until it closes.
///
/// Requests on a connection are multiplexed by id; each runs on its own
/// task so a long stream never blocks the others. Closing the connection
/// cancels everything still in flight.
pub async fn handle_connection<S>(dispatcher: Arc<Dispatcher>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    trace!("New connection accepted");
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedReader::length_prefixed(read_half);

    let (out_tx, mut out_rx) = mpsc::channel::<ResponseEnvelope>(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(async move {
        let mut writer = FramedWriter::length_prefixed(write_half);
        while let Some(envelope) = out_rx.recv().await {
            if let Err(e) = writer.send(&envelope).await {
                debug!("Client went away: {}", e);
                break;
            }
        }
    });

    let mut in_flight: HashMap<u64, oneshot::Sender<()>> = HashMap::new();
    loop {
        match reader.next::<ClientMessage>().await {
            Ok(Some(ClientMessage::Request(request))) => {
                in_flight.retain(|_, cancel| !cancel.is_closed());
                let (cancel_tx, cancel_rx) = oneshot::channel();
                if in_flight.insert(request.id, cancel_tx).is_some() {
                    warn!("Request id {} reused, cancelling the earlier stream", request.id);
                }
                let stream = dispatcher.dispatch(request);
                tokio::spawn(relay_to_client(stream, out_tx.clone(), cancel_rx));
            }
            Ok(Some(ClientMessage::Cancel { id })) => {
                debug!("Client cancelled request {}", id);
                if let Some(cancel) = in_flight.remove(&id) {
                    let _ = cancel.send(());
                }
            }
            Ok(None) => break,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!("Invalid frame from client: {}", e);
                let envelope = ResponseEnvelope::error(400, format!("Invalid request: {e}"));
                if out_tx.send(envelope).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Connection read error: {}", e);
                break;
            }
        }
    }

    trace!("Connection closed, cancelling {} stream(s)", in_flight.len());
    drop(in_flight);
    drop(out_tx);
    writer.await.context("Connection writer task failed")?;
    Ok(())
}

async fn relay_to_client(
    mut stream: ResponseStream,
    out: mpsc::Sender<ResponseEnvelope>,
    mut cancel: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            envelope = stream.next() => match envelope {
                Some(envelope) => {
                    if out.send(envelope).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = &mut cancel => {
                stream.cancel();
                return;
            }
        }
    }
}

/// PID recorded in `path`, if that process is still alive.
pub fn running_pid(path: &Path) -> Option<u32> {
    let pid: u32 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
    is_process_running(pid).then_some(pid)
}

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::RequestEnvelope;
    use crate::plugin::{testing, SupervisorConfig};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt as _;

    fn dispatcher() -> Arc<Dispatcher> {
        let supervisor = Supervisor::new(SupervisorConfig {
            host: testing::host(),
            spawn: testing::spawn_options(),
            shutdown_timeout: Duration::from_secs(5),
            internal: testing::internal_registry(),
            log_buffer_lines: 100,
        });
        Arc::new(Dispatcher::new(Arc::new(supervisor)))
    }

    #[tokio::test]
    async fn test_connection_multiplexes_and_cancels() {
        let dispatcher = dispatcher();
        let logs = Arc::clone(dispatcher.supervisor().logs());
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handler = tokio::spawn(handle_connection(Arc::clone(&dispatcher), server));

        let (read_half, write_half) = tokio::io::split(client);
        let mut reader = FramedReader::length_prefixed(read_half);
        let mut writer = FramedWriter::length_prefixed(write_half);

        logs.push("android", "hello".into());
        writer
            .send(&ClientMessage::Request(
                RequestEnvelope::new("/daemon/logcat").id(1).streaming(true),
            ))
            .await
            .unwrap();
        let event: ResponseEnvelope = reader.next().await.unwrap().unwrap();
        assert_eq!(event.id, Some(1));
        assert!(!event.fin);

        // A second request is answered while the first still streams.
        writer
            .send(&ClientMessage::Request(RequestEnvelope::new("/nope").id(2)))
            .await
            .unwrap();
        let reply: ResponseEnvelope = reader.next().await.unwrap().unwrap();
        assert_eq!(reply.id, Some(2));
        assert_eq!(reply.status, 404);
        assert!(reply.fin);

        writer.send(&ClientMessage::Cancel { id: 1 }).await.unwrap();
        writer.into_inner().shutdown().await.unwrap();

        // The endless logcat stream is torn down, so the connection closes.
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(envelope) = reader.next::<ResponseEnvelope>().await.unwrap() {
                assert_eq!(envelope.id, Some(1));
                assert!(!envelope.fin);
            }
        })
        .await;
        assert!(drained.is_ok());
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_garbage_frame_gets_error_reply() {
        let dispatcher = dispatcher();
        let (client, server) = tokio::io::duplex(4096);
        let handler = tokio::spawn(handle_connection(dispatcher, server));

        let (read_half, write_half) = tokio::io::split(client);
        let mut reader = FramedReader::length_prefixed(read_half);
        let mut writer = FramedWriter::length_prefixed(write_half);

        writer.send(&json!({ "what": "ever" })).await.unwrap();
        let reply: ResponseEnvelope = reader.next().await.unwrap().unwrap();
        assert_eq!(reply.status, 400);
        assert!(reply.fin);

        writer.into_inner().shutdown().await.unwrap();
        assert!(reader.next::<ResponseEnvelope>().await.unwrap().is_none());
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_does_not_desync_connection() {
        use crate::daemon::transport::MAX_FRAME_LEN;
        use tokio::io::AsyncWriteExt;

        let dispatcher = dispatcher();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handler = tokio::spawn(handle_connection(dispatcher, server));

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = FramedReader::length_prefixed(read_half);

        let len = MAX_FRAME_LEN + 1;
        write_half.write_all(&(len as u32).to_le_bytes()).await.unwrap();
        write_half.write_all(&vec![b' '; len]).await.unwrap();
        let mut writer = FramedWriter::length_prefixed(write_half);
        writer
            .send(&ClientMessage::Request(RequestEnvelope::new("/daemon/health").id(5)))
            .await
            .unwrap();

        let rejected: ResponseEnvelope = reader.next().await.unwrap().unwrap();
        assert_eq!(rejected.status, 400);
        let health: ResponseEnvelope = reader.next().await.unwrap().unwrap();
        assert_eq!(health.id, Some(5));
        assert_eq!(health.status, 200);

        writer.into_inner().shutdown().await.unwrap();
        handler.await.unwrap().unwrap();
    }

    #[test]
    fn test_stale_pid_file_is_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.pid");
        assert_eq!(running_pid(&path), None);
        std::fs::write(&path, "not a pid").unwrap();
        assert_eq!(running_pid(&path), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_own_pid_is_running() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.pid");
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        assert_eq!(running_pid(&path), Some(std::process::id()));
    }
}
