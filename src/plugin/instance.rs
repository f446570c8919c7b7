use super::host::{ExitHook, ExternalHost, SpawnOptions};
use super::internal::{InternalPlugin, InternalRegistry};
use super::manifest::{HostEnvironment, PluginKind, PluginManifest};
use crate::daemon::log_buffer::LogBuffer;
use crate::daemon::protocol::ResponseEnvelope;
use crate::error::{PluginError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Lifecycle state of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    Starting,
    Started,
    Stopping,
    Crashed,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Starting => "starting",
            PluginState::Started => "started",
            PluginState::Stopping => "stopping",
            PluginState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of an instance, as reported by the info endpoint and
/// the daemon status services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub package_name: String,
    pub version: Option<String>,
    pub path: PathBuf,
    pub main: PathBuf,
    #[serde(rename = "type")]
    pub kind: PluginKind,
    #[serde(rename = "nodeVersion")]
    pub runtime_version: String,
    pub supported: bool,
    pub error: Option<String>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Milliseconds from spawn to ready.
    pub startup_time: Option<u64>,
    pub state: PluginState,
    pub total_requests: u64,
    pub active_requests: u64,
}

/// Invoked when a started instance crashes.
pub(crate) type CrashHook = Arc<dyn Fn(&PluginInstance) + Send + Sync>;

/// Everything `load()` needs besides the instance itself.
#[derive(Clone)]
pub(crate) struct LoadContext {
    pub host: HostEnvironment,
    pub spawn: SpawnOptions,
    pub internal: InternalRegistry,
    pub logs: Arc<LogBuffer>,
    pub on_crash: Option<CrashHook>,
}

#[derive(Clone)]
enum Runtime {
    Internal(Arc<dyn InternalPlugin>),
    External(Arc<ExternalHost>),
}

struct InstanceState {
    state: PluginState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    startup_time: Option<Duration>,
    last_error: Option<PluginError>,
    runtime: Option<Runtime>,
    /// Bumped on every spawn so exits of old hosts are ignored.
    generation: u64,
    /// Cancels the spawn in progress while `Starting`.
    abort_start: Option<oneshot::Sender<()>>,
    /// Unloads waiting for a cancelled start to wind down.
    stop_waiters: Vec<oneshot::Sender<Option<i32>>>,
}

enum Stop {
    Running(Arc<ExternalHost>),
    Starting(oneshot::Receiver<Option<i32>>),
}

/// One registered (name, version) and its runtime state.
///
/// State changes are crate-private; the supervisor drives them and the
/// dispatcher only touches the request counters through [`RequestGuard`].
pub struct PluginInstance {
    manifest: PluginManifest,
    inner: Mutex<InstanceState>,
    total_requests: AtomicU64,
    active_requests: AtomicU64,
}

impl PluginInstance {
    pub fn new(manifest: PluginManifest) -> Self {
        Self {
            manifest,
            inner: Mutex::new(InstanceState {
                state: PluginState::Unloaded,
                pid: None,
                exit_code: None,
                startup_time: None,
                last_error: None,
                runtime: None,
                generation: 0,
                abort_start: None,
                stop_waiters: Vec::new(),
            }),
            total_requests: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
        }
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn label(&self) -> String {
        self.manifest.label()
    }

    pub fn state(&self) -> PluginState {
        self.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::SeqCst)
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// Why this plugin can never be loaded, if it can't.
    pub fn unavailable(&self) -> Option<PluginError> {
        self.manifest.error().cloned()
    }

    pub fn info(&self) -> PluginInfo {
        let inner = self.lock();
        let error = self
            .manifest
            .error()
            .or(inner.last_error.as_ref())
            .map(|e| e.to_string());
        PluginInfo {
            name: self.manifest.name.clone(),
            package_name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            path: self.manifest.path.clone(),
            main: self.manifest.entry_point.clone(),
            kind: self.manifest.kind,
            runtime_version: self.manifest.required_runtime_version.clone(),
            supported: self.manifest.supported,
            error,
            pid: inner.pid,
            exit_code: inner.exit_code,
            startup_time: inner.startup_time.map(|d| d.as_millis() as u64),
            state: inner.state,
            total_requests: self.total_requests(),
            active_requests: self.active_requests(),
        }
    }

    /// Bring the instance to `Started`.
    pub(crate) async fn load(self: &Arc<Self>, ctx: &LoadContext) -> Result<()> {
        if !self.manifest.supported {
            return Err(PluginError::PlatformUnsupported {
                platform: ctx.host.platform.clone(),
            });
        }
        if let Some(err) = self.manifest.error() {
            return Err(err.clone());
        }

        let generation = {
            let mut inner = self.lock();
            match inner.state {
                PluginState::Started => return Ok(()),
                PluginState::Crashed => return Err(self.crashed(&inner)),
                PluginState::Starting | PluginState::Stopping => {
                    return Err(PluginError::Unavailable {
                        reason: format!("Plugin {} is {}", self.label(), inner.state),
                    })
                }
                PluginState::Unloaded => {}
            }
            inner.generation += 1;
            inner.generation
        };

        match self.manifest.kind {
            PluginKind::Internal => self.load_internal(ctx),
            PluginKind::External => self.load_external(ctx, generation).await,
        }
    }

    fn load_internal(&self, ctx: &LoadContext) -> Result<()> {
        let label = self.label();
        let factory = ctx.internal.get(&self.manifest.name).ok_or_else(|| {
            PluginError::MissingInternalFactory {
                name: self.manifest.name.clone(),
            }
        })?;

        let started = Instant::now();
        let plugin = factory(&self.manifest).map_err(|e| {
            let err = PluginError::SpawnError {
                plugin: label.clone(),
                reason: format!("{e:#}"),
            };
            self.lock().last_error = Some(err.clone());
            err
        })?;

        let mut inner = self.lock();
        inner.state = PluginState::Started;
        inner.startup_time = Some(started.elapsed());
        inner.runtime = Some(Runtime::Internal(plugin));
        inner.last_error = None;
        info!("Started internal plugin {}", label);
        Ok(())
    }

    async fn load_external(self: &Arc<Self>, ctx: &LoadContext, generation: u64) -> Result<()> {
        let label = self.label();
        let (abort_tx, abort_rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            inner.state = PluginState::Starting;
            inner.exit_code = None;
            inner.abort_start = Some(abort_tx);
        }
        info!("Starting external plugin {}", label);

        let weak = Arc::downgrade(self);
        let on_crash = ctx.on_crash.clone();
        let on_exit: ExitHook = Arc::new(move |code| {
            if let Some(instance) = weak.upgrade() {
                if instance.record_exit(generation, code) {
                    if let Some(hook) = &on_crash {
                        hook(&instance);
                    }
                }
            }
        });

        let started = Instant::now();
        let spawned = ExternalHost::spawn(
            &self.manifest,
            &ctx.spawn,
            &ctx.host.runtime_version,
            Arc::clone(&ctx.logs),
            on_exit,
            abort_rx,
        )
        .await;

        let waiters = {
            let mut inner = self.lock();
            inner.abort_start = None;
            if inner.generation != generation || inner.state != PluginState::Stopping {
                return self.finish_start(&mut inner, spawned, generation, started);
            }
            std::mem::take(&mut inner.stop_waiters)
        };
        self.finish_cancelled_start(spawned, waiters).await
    }

    fn finish_start(
        &self,
        inner: &mut InstanceState,
        spawned: Result<Arc<ExternalHost>>,
        generation: u64,
        started: Instant,
    ) -> Result<()> {
        let label = self.label();
        match spawned {
            Ok(host) => {
                if inner.generation != generation || inner.state != PluginState::Starting {
                    // Exited between signalling ready and here.
                    return Err(self.crashed(inner));
                }
                inner.state = PluginState::Started;
                inner.pid = host.pid();
                inner.startup_time = Some(started.elapsed());
                inner.runtime = Some(Runtime::External(host));
                inner.last_error = None;
                info!(
                    "Started external plugin {} (PID {:?}) in {:?}",
                    label,
                    inner.pid,
                    started.elapsed()
                );
                Ok(())
            }
            Err(err) => {
                if inner.generation == generation && inner.state == PluginState::Starting {
                    inner.state = PluginState::Unloaded;
                }
                inner.last_error = Some(err.clone());
                warn!("Failed to start plugin {}: {}", label, err);
                Err(err)
            }
        }
    }

    /// Wind down a start that an unload interrupted, then wake the unloads.
    async fn finish_cancelled_start(
        &self,
        spawned: Result<Arc<ExternalHost>>,
        waiters: Vec<oneshot::Sender<Option<i32>>>,
    ) -> Result<()> {
        // Ready may have raced the abort; such a host is stopped here.
        let code = match spawned {
            Ok(host) => {
                host.kill();
                host.wait_exit().await
            }
            Err(_) => self.exit_code(),
        };
        {
            let mut inner = self.lock();
            inner.state = PluginState::Unloaded;
            inner.pid = None;
            inner.runtime = None;
            inner.exit_code = code;
        }
        info!("Stopped starting plugin {} (exit code {:?})", self.label(), code);
        for waiter in waiters {
            let _ = waiter.send(code);
        }
        Err(PluginError::Unavailable {
            reason: format!("Plugin {} was unloaded while starting", self.label()),
        })
    }

    /// Record the exit of the host spawned as `generation`. Returns whether
    /// the exit was a crash.
    fn record_exit(&self, generation: u64, code: Option<i32>) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.exit_code = code;
        inner.pid = None;
        match inner.state {
            PluginState::Starting | PluginState::Started => {
                inner.state = PluginState::Crashed;
                inner.runtime = None;
                true
            }
            _ => false,
        }
    }

    /// Stop an external host. Returns its exit code.
    pub(crate) async fn unload(&self, timeout: Duration) -> Result<Option<i32>> {
        if self.manifest.kind == PluginKind::Internal {
            return Err(PluginError::CannotUnloadInternal);
        }

        let stop = {
            let mut inner = self.lock();
            match inner.state {
                PluginState::Started => match inner.runtime.take() {
                    Some(Runtime::External(host)) => {
                        inner.state = PluginState::Stopping;
                        Stop::Running(host)
                    }
                    _ => {
                        inner.state = PluginState::Unloaded;
                        return Ok(inner.exit_code);
                    }
                },
                PluginState::Starting => {
                    let Some(abort) = inner.abort_start.take() else {
                        return Err(PluginError::Unavailable {
                            reason: format!("Plugin {} is still starting", self.label()),
                        });
                    };
                    inner.state = PluginState::Stopping;
                    let (done_tx, done_rx) = oneshot::channel();
                    inner.stop_waiters.push(done_tx);
                    let _ = abort.send(());
                    Stop::Starting(done_rx)
                }
                _ => return Ok(inner.exit_code),
            }
        };

        let host = match stop {
            Stop::Running(host) => host,
            Stop::Starting(done) => {
                info!("Cancelling startup of external plugin {}", self.label());
                return Ok(done.await.unwrap_or_default());
            }
        };

        info!("Stopping external plugin {}", self.label());
        let code = host.shutdown(timeout).await;

        let mut inner = self.lock();
        inner.state = PluginState::Unloaded;
        inner.pid = None;
        inner.exit_code = code;
        info!("Stopped external plugin {} (exit code {:?})", self.label(), code);
        Ok(code)
    }

    /// Clear a crash so the next load spawns a fresh host.
    pub(crate) fn reset(&self) {
        let mut inner = self.lock();
        if inner.state == PluginState::Crashed {
            debug!("Resetting crashed plugin {}", self.label());
            inner.state = PluginState::Unloaded;
            inner.last_error = None;
        }
    }

    /// Count a request against this instance until the guard is released.
    pub fn begin_request(self: &Arc<Self>) -> RequestGuard {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            instance: Arc::clone(self),
            released: false,
        }
    }

    /// Hand a request to the running plugin.
    pub(crate) async fn call(&self, path: &str, data: Value) -> Result<Exchange> {
        let runtime = {
            let inner = self.lock();
            match (&inner.runtime, inner.state) {
                (Some(runtime), PluginState::Started) => runtime.clone(),
                (_, PluginState::Crashed) => return Err(self.crashed(&inner)),
                (_, state) => {
                    return Err(PluginError::Unavailable {
                        reason: format!("Plugin {} is {}", self.label(), state),
                    })
                }
            }
        };

        match runtime {
            Runtime::Internal(plugin) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let envelope = match plugin.handle(path, &data) {
                    Ok(message) => ResponseEnvelope::ok(message),
                    Err(e) => ResponseEnvelope::error(500, format!("{e:#}")),
                };
                let _ = tx.send(envelope);
                Ok(Exchange { rx, remote: None })
            }
            Runtime::External(host) => {
                let (id, rx) = host.request(path, data).await?;
                Ok(Exchange {
                    rx,
                    remote: Some((host, id)),
                })
            }
        }
    }

    fn crashed(&self, inner: &InstanceState) -> PluginError {
        PluginError::Crashed {
            plugin: self.label(),
            exit_code: inner.exit_code,
        }
    }

    fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}

/// Keeps `activeRequests` raised until released, explicitly or on drop.
pub struct RequestGuard {
    instance: Arc<PluginInstance>,
    released: bool,
}

impl RequestGuard {
    pub fn instance(&self) -> &Arc<PluginInstance> {
        &self.instance
    }

    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.instance.active_requests.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Envelopes produced by one forwarded request.
pub(crate) struct Exchange {
    rx: mpsc::UnboundedReceiver<ResponseEnvelope>,
    remote: Option<(Arc<ExternalHost>, u64)>,
}

impl Exchange {
    /// Next envelope, or `None` once the plugin side is done.
    pub(crate) async fn next(&mut self) -> Option<ResponseEnvelope> {
        self.rx.recv().await
    }

    /// Tell an external host to abandon the request.
    pub(crate) async fn cancel(self) {
        if let Some((host, id)) = self.remote {
            host.cancel(id).await;
        }
    }
}
