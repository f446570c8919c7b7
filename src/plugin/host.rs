//! Supervised child process hosting an external plugin.
//!
//! The daemon writes [`HostCommand`]s to the child's stdin and reads
//! [`HostMessage`]s from its stdout, one JSON document per line. stderr is
//! captured into the [`LogBuffer`].

use super::manifest::PluginManifest;
use crate::daemon::log_buffer::LogBuffer;
use crate::daemon::protocol::{HostCommand, HostMessage, ResponseEnvelope};
use crate::daemon::transport::{FramedReader, FramedWriter};
use crate::error::{PluginError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Called once with the exit code when the child process ends.
pub(crate) type ExitHook = Arc<dyn Fn(Option<i32>) + Send + Sync>;

type Pending = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<ResponseEnvelope>>>>;

/// How external plugin hosts are launched.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Program that runs the entry point. `None` executes it directly.
    pub interpreter: Option<PathBuf>,
    /// How long a host has to report `ready`.
    pub startup_timeout: Duration,
    /// Grace period after `SIGTERM` before the host is killed.
    pub kill_grace: Duration,
    /// Extra environment for every host.
    pub env: Vec<(String, String)>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            interpreter: None,
            startup_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
            env: Vec::new(),
        }
    }
}

pub(crate) struct ExternalHost {
    label: String,
    pid: Option<u32>,
    commands: tokio::sync::Mutex<FramedWriter<ChildStdin>>,
    pending: Pending,
    next_id: AtomicU64,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<Option<i32>>>,
    kill_grace: Duration,
}

enum Startup {
    Ready,
    Exited,
    Aborted,
}

impl ExternalHost {
    /// Start the host and wait until it reports `ready`.
    ///
    /// A message on `abort` while waiting kills the host and fails the
    /// start with [`PluginError::Unavailable`].
    pub(crate) async fn spawn(
        manifest: &PluginManifest,
        options: &SpawnOptions,
        runtime_version: &str,
        logs: Arc<LogBuffer>,
        on_exit: ExitHook,
        abort: oneshot::Receiver<()>,
    ) -> Result<Arc<Self>> {
        let label = manifest.label();

        let mut cmd = match &options.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&manifest.entry_point);
                cmd
            }
            None => Command::new(&manifest.entry_point),
        };
        cmd.current_dir(&manifest.path)
            .env("PLUGIND_PLUGIN_NAME", &manifest.name)
            .env(
                "PLUGIND_PLUGIN_VERSION",
                manifest.version.as_deref().unwrap_or_default(),
            )
            .env("PLUGIND_RUNTIME_VERSION", runtime_version);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn plugin host for {}: {}", label, e);
            PluginError::SpawnError {
                plugin: label.clone(),
                reason: e.to_string(),
            }
        })?;
        let pid = child.id();
        info!("Spawned plugin host for {} with PID {:?}", label, pid);

        let stdin = child.stdin.take().ok_or_else(|| PluginError::SpawnError {
            plugin: label.clone(),
            reason: "stdin was not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PluginError::SpawnError {
            plugin: label.clone(),
            reason: "stdout was not captured".to_string(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            let name = manifest.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.push(&name, line);
                }
            });
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(read_host_messages(
            label.clone(),
            FramedReader::lines(stdout),
            Arc::clone(&pending),
            ready_tx,
        ));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(
            label.clone(),
            child,
            kill_rx,
            Arc::clone(&pending),
            exit_tx,
            on_exit,
        ));

        let host = Arc::new(Self {
            label: label.clone(),
            pid,
            commands: tokio::sync::Mutex::new(FramedWriter::lines(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            kill: Mutex::new(Some(kill_tx)),
            exit: exit_rx,
            kill_grace: options.kill_grace,
        });

        let exit = host.exit.clone();
        let ready = tokio::time::timeout(options.startup_timeout, async move {
            tokio::select! {
                ready = ready_rx => match ready {
                    Ok(()) => Startup::Ready,
                    Err(_) => Startup::Exited,
                },
                _ = wait_exit_code(exit) => Startup::Exited,
                Ok(()) = abort => Startup::Aborted,
            }
        })
        .await;

        match ready {
            Ok(Startup::Ready) => {
                debug!("Plugin host {} is ready", label);
                Ok(host)
            }
            Ok(Startup::Aborted) => {
                host.kill();
                let exit_code = host.wait_exit().await;
                info!(
                    "Startup of plugin host {} cancelled (exit code {:?})",
                    label, exit_code
                );
                Err(PluginError::Unavailable {
                    reason: format!("Plugin {label} was unloaded while starting"),
                })
            }
            Ok(Startup::Exited) => {
                host.kill();
                let exit_code = host.wait_exit().await;
                warn!(
                    "Plugin host {} exited before becoming ready (exit code {:?})",
                    label, exit_code
                );
                Err(PluginError::Crashed {
                    plugin: label,
                    exit_code,
                })
            }
            Err(_) => {
                warn!("Plugin host {} did not become ready in time, killing", label);
                host.kill();
                host.wait_exit().await;
                Err(PluginError::StartupTimeout {
                    plugin: label,
                    secs: options.startup_timeout.as_secs(),
                })
            }
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Forward a request. Every envelope the host emits for it arrives on
    /// the returned receiver; the sender is dropped after `fin`.
    pub(crate) async fn request(
        &self,
        path: &str,
        data: Value,
    ) -> Result<(u64, mpsc::UnboundedReceiver<ResponseEnvelope>)> {
        if self.has_exited() {
            return Err(self.crashed());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.pending).insert(id, tx);

        // The exit watcher may have drained the pending map already.
        if self.has_exited() {
            lock(&self.pending).remove(&id);
            return Err(self.crashed());
        }

        let command = HostCommand::Request {
            id,
            path: path.to_string(),
            data,
        };
        if let Err(e) = self.send(&command).await {
            lock(&self.pending).remove(&id);
            return Err(PluginError::Transport(e.to_string()));
        }
        trace!("Forwarded request {} {} to {}", id, path, self.label);
        Ok((id, rx))
    }

    /// Stop routing envelopes for `id` and tell the host to drop it.
    pub(crate) async fn cancel(&self, id: u64) {
        let removed = lock(&self.pending).remove(&id).is_some();
        if removed {
            debug!("Cancelling request {} on {}", id, self.label);
            if let Err(e) = self.send(&HostCommand::Cancel { id }).await {
                debug!("Could not deliver cancel to {}: {}", self.label, e);
            }
        }
    }

    /// Ask the host to exit, escalating to `SIGTERM` and then a kill.
    pub(crate) async fn shutdown(&self, timeout: Duration) -> Option<i32> {
        if let Err(e) = self.send(&HostCommand::Shutdown).await {
            debug!("Could not deliver shutdown to {}: {}", self.label, e);
        }

        if let Ok(code) = tokio::time::timeout(timeout, self.wait_exit()).await {
            return code;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            warn!("Plugin host {} did not stop in time, sending SIGTERM", self.label);
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if let Ok(code) = tokio::time::timeout(self.kill_grace, self.wait_exit()).await {
                return code;
            }
        }

        warn!("Force killing plugin host {}", self.label);
        self.kill();
        self.wait_exit().await
    }

    pub(crate) fn kill(&self) {
        if let Some(tx) = lock(&self.kill).take() {
            let _ = tx.send(());
        }
    }

    pub(crate) async fn wait_exit(&self) -> Option<i32> {
        wait_exit_code(self.exit.clone()).await
    }

    async fn send(&self, command: &HostCommand) -> std::io::Result<()> {
        let mut commands = self.commands.lock().await;
        commands.send(command).await
    }

    fn crashed(&self) -> PluginError {
        let exit = *self.exit.borrow();
        PluginError::Crashed {
            plugin: self.label.clone(),
            exit_code: exit.flatten(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn wait_exit_code(mut exit: watch::Receiver<Option<Option<i32>>>) -> Option<i32> {
    loop {
        let current = *exit.borrow_and_update();
        if let Some(code) = current {
            return code;
        }
        if exit.changed().await.is_err() {
            return None;
        }
    }
}

async fn read_host_messages(
    label: String,
    mut reader: FramedReader<ChildStdout>,
    pending: Pending,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    loop {
        match reader.next::<HostMessage>().await {
            Ok(Some(HostMessage::Ready)) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Some(HostMessage::ShutdownAck)) => {
                debug!("Plugin host {} acknowledged shutdown", label);
            }
            Ok(Some(HostMessage::Envelope(envelope))) => {
                let Some(id) = envelope.id else {
                    warn!("Dropping envelope without id from {}", label);
                    continue;
                };
                let mut pending = lock(&pending);
                let delivered = match pending.get(&id) {
                    Some(tx) => tx.send(envelope.clone()).is_ok(),
                    None => {
                        trace!("No pending request {} on {}", id, label);
                        continue;
                    }
                };
                if envelope.fin || !delivered {
                    pending.remove(&id);
                }
            }
            Ok(None) => break,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!("Ignoring malformed message from {}: {}", label, e);
            }
            Err(e) => {
                warn!("Lost stdout of plugin host {}: {}", label, e);
                break;
            }
        }
    }
    trace!("Stopped reading plugin host {}", label);
}

async fn watch_exit(
    label: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    pending: Pending,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    on_exit: ExitHook,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            error!("Failed to wait for plugin host {}: {}", label, e);
            None
        }
    };
    debug!("Plugin host {} exited with code {:?}", label, exit_code);

    // State transition first, so anyone woken by the failure envelopes below
    // already observes it.
    on_exit(exit_code);

    let orphaned: Vec<_> = lock(&pending).drain().collect();
    if !orphaned.is_empty() {
        let err = PluginError::Crashed {
            plugin: label.clone(),
            exit_code,
        };
        warn!(
            "Failing {} in-flight request(s) on {}",
            orphaned.len(),
            label
        );
        for (id, tx) in orphaned {
            let _ = tx.send(ResponseEnvelope::from_error(&err).with_id(id));
        }
    }

    let _ = exit_tx.send(Some(exit_code));
}
