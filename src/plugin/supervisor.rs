use super::host::SpawnOptions;
use super::instance::{CrashHook, LoadContext, PluginInfo, PluginInstance, PluginState};
use super::internal::InternalRegistry;
use super::manifest::{HostEnvironment, PluginKind, PluginManifest, MANIFEST_FILE};
use crate::daemon::log_buffer::LogBuffer;
use crate::error::{PluginError, Result};
use crate::mutex::NamedMutex;
use semver::Version;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PluginKey {
    name: String,
    version: Option<String>,
}

impl PluginKey {
    fn of(manifest: &PluginManifest) -> Self {
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SupervisorConfig {
    pub host: HostEnvironment,
    pub spawn: SpawnOptions,
    /// How long an external host gets to exit after `shutdown`.
    pub shutdown_timeout: Duration,
    pub internal: InternalRegistry,
    pub log_buffer_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: HostEnvironment::current(),
            spawn: SpawnOptions::default(),
            shutdown_timeout: Duration::from_secs(10),
            internal: InternalRegistry::new(),
            log_buffer_lines: 10_000,
        }
    }
}

/// Outcome of a discovery pass. Problems are collected, never raised.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Labels of newly registered plugins.
    pub registered: Vec<String>,
    pub errors: Vec<PluginError>,
}

/// Owns every registered [`PluginInstance`] and serialises their loads.
pub struct Supervisor {
    instances: RwLock<BTreeMap<PluginKey, Arc<PluginInstance>>>,
    loads: NamedMutex<Arc<PluginInstance>, PluginError>,
    ctx: Arc<LoadContext>,
    shutdown_timeout: Duration,
    logs: Arc<LogBuffer>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let logs = Arc::new(LogBuffer::new(config.log_buffer_lines));

        let crash_log = Arc::clone(&logs);
        let on_crash: CrashHook = Arc::new(move |instance: &PluginInstance| {
            let code = instance.exit_code();
            warn!(
                "Plugin {} crashed (exit code {:?})",
                instance.label(),
                code
            );
            crash_log.push(
                &instance.manifest().name,
                format!("[plugind] host exited unexpectedly with code {:?}", code),
            );
        });

        Self {
            instances: RwLock::new(BTreeMap::new()),
            loads: NamedMutex::new(),
            ctx: Arc::new(LoadContext {
                host: config.host,
                spawn: config.spawn,
                internal: config.internal,
                logs: Arc::clone(&logs),
                on_crash: Some(on_crash),
            }),
            shutdown_timeout: config.shutdown_timeout,
            logs,
        }
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn host(&self) -> &HostEnvironment {
        &self.ctx.host
    }

    /// Scan plugin roots and register every plugin found.
    ///
    /// A root may itself be a plugin directory. Otherwise each
    /// sub-directory is tried, descending one level into `@scope`
    /// directories.
    pub async fn discover(&self, roots: &[PathBuf]) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for root in roots {
            if root.join(MANIFEST_FILE).is_file() {
                self.discover_dir(root, &mut report);
                continue;
            }

            debug!("Scanning plugin root {}", root.display());
            for dir in list_dirs(root).await {
                let scoped = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('@'));
                if scoped && !dir.join(MANIFEST_FILE).is_file() {
                    for inner in list_dirs(&dir).await {
                        self.discover_dir(&inner, &mut report);
                    }
                } else {
                    self.discover_dir(&dir, &mut report);
                }
            }
        }

        info!(
            "Discovered {} plugin(s), {} problem(s)",
            report.registered.len(),
            report.errors.len()
        );
        report
    }

    fn discover_dir(&self, dir: &Path, report: &mut DiscoveryReport) {
        let manifest = match PluginManifest::load(dir, &self.ctx.host) {
            Ok(manifest) => manifest,
            Err(PluginError::NotAPlugin { .. }) => {
                debug!("Skipping {}: not a plugin", dir.display());
                return;
            }
            Err(e) => {
                warn!("{}", e);
                report.errors.push(e);
                return;
            }
        };

        match self.register(manifest) {
            Ok(instance) => report.registered.push(instance.label()),
            Err(e) => {
                warn!("{}", e);
                report.errors.push(e);
            }
        }
    }

    /// Add an instance for `manifest`. The first registration of a
    /// (name, version) wins.
    pub fn register(&self, manifest: PluginManifest) -> Result<Arc<PluginInstance>> {
        let key = PluginKey::of(&manifest);
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = instances.get(&key) {
            return Err(PluginError::DuplicatePlugin {
                name: manifest.name,
                version: manifest.version.unwrap_or_else(|| "null".to_string()),
                existing: existing.manifest().path.clone(),
            });
        }

        let instance = Arc::new(PluginInstance::new(manifest));
        info!(
            "Registered {} plugin {} from {}",
            instance.manifest().kind.as_str(),
            instance.label(),
            instance.manifest().path.display()
        );
        instances.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    /// Find the instance a request for `name` (and `version`) targets.
    ///
    /// A given version matches its exact string first (a leading `v` is
    /// ignored), then any registered version that is semver-equal, so `1.0`
    /// finds `1.0.0`.
    ///
    /// Without a version the highest version that has not crashed is chosen,
    /// preferring the ones [`versions`](Self::versions) lists. Only when none
    /// of those exist does an errored or unsupported version answer, so its
    /// reason reaches the caller.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Result<Arc<PluginInstance>> {
        self.select(name, version, true)
    }

    fn select(
        &self,
        name: &str,
        version: Option<&str>,
        skip_crashed: bool,
    ) -> Result<Arc<PluginInstance>> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        let candidates = instances.iter().filter(|(key, _)| key.name == name);

        match version {
            Some(requested) => {
                let requested = requested.strip_prefix('v').unwrap_or(requested);
                let wanted = parse_version(Some(requested));
                candidates
                    .clone()
                    .find(|(key, _)| key.version.as_deref() == Some(requested))
                    .or_else(|| {
                        wanted.as_ref().and_then(|wanted| {
                            candidates.clone().find(|(key, _)| {
                                parse_version(key.version.as_deref()).as_ref() == Some(wanted)
                            })
                        })
                    })
                    .map(|(_, instance)| Arc::clone(instance))
                    .ok_or(PluginError::NotFound)
            }
            None => {
                let live: Vec<_> = candidates
                    .filter(|(_, instance)| {
                        !skip_crashed || instance.state() != PluginState::Crashed
                    })
                    .collect();
                let highest = |available_only: bool| {
                    live.iter()
                        .filter(|(_, instance)| !available_only || instance.unavailable().is_none())
                        .max_by(|(a, _), (b, _)| {
                            parse_version(a.version.as_deref())
                                .cmp(&parse_version(b.version.as_deref()))
                        })
                        .map(|(_, instance)| Arc::clone(instance))
                };
                highest(true)
                    .or_else(|| highest(false))
                    .ok_or(PluginError::NotFound)
            }
        }
    }

    /// Resolve and make sure the instance is `Started`.
    ///
    /// Concurrent calls for one plugin share a single load.
    pub async fn ensure_loaded(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Arc<PluginInstance>> {
        let instance = self.resolve(name, version)?;
        self.load(instance).await
    }

    pub(crate) async fn load(&self, instance: Arc<PluginInstance>) -> Result<Arc<PluginInstance>> {
        match instance.state() {
            PluginState::Started => return Ok(instance),
            PluginState::Crashed => {
                return Err(PluginError::Crashed {
                    plugin: instance.label(),
                    exit_code: instance.exit_code(),
                })
            }
            _ => {}
        }

        let key = instance.label();
        let ctx = Arc::clone(&self.ctx);
        self.loads
            .run(&key, move || async move {
                instance.load(&ctx).await?;
                Ok(instance)
            })
            .await
    }

    /// Stop an external plugin. Returns the host's exit code.
    pub async fn unload(&self, name: &str, version: Option<&str>) -> Result<Option<i32>> {
        let instance = self.select(name, version, false)?;
        let timeout = self.shutdown_timeout;
        let key = format!("unload:{}", instance.label());
        let target = Arc::clone(&instance);
        self.loads
            .run(&key, move || async move {
                target.unload(timeout).await?;
                Ok(target)
            })
            .await?;
        Ok(instance.exit_code())
    }

    /// Restart a plugin, clearing a crash.
    pub async fn reload(&self, name: &str, version: Option<&str>) -> Result<Arc<PluginInstance>> {
        let instance = self.select(name, version, false)?;
        info!("Reloading plugin {}", instance.label());
        let key = instance.label();
        let ctx = Arc::clone(&self.ctx);
        let timeout = self.shutdown_timeout;
        self.loads
            .run(&key, move || async move {
                if instance.manifest().kind == PluginKind::External {
                    instance.unload(timeout).await?;
                }
                instance.reset();
                instance.load(&ctx).await?;
                Ok(instance)
            })
            .await
    }

    /// Unload every running external plugin.
    pub async fn shutdown(&self) {
        let running: Vec<Arc<PluginInstance>> = self
            .instances()
            .into_iter()
            .filter(|i| {
                i.manifest().kind == PluginKind::External && i.state() == PluginState::Started
            })
            .collect();
        if running.is_empty() {
            return;
        }

        info!("Stopping {} external plugin(s)", running.len());
        let mut tasks = JoinSet::new();
        for instance in running {
            let timeout = self.shutdown_timeout;
            tasks.spawn(async move {
                if let Err(e) = instance.unload(timeout).await {
                    warn!("Failed to stop plugin {}: {}", instance.label(), e);
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Snapshot of every registered instance.
    pub fn list(&self) -> Vec<PluginInfo> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances.values().map(|instance| instance.info()).collect()
    }

    pub fn instances(&self) -> Vec<Arc<PluginInstance>> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances.values().cloned().collect()
    }

    /// Versions of `name` a request could currently be routed to, newest
    /// first.
    pub fn versions(&self, name: &str) -> Vec<String> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        let mut versions: Vec<&String> = instances
            .iter()
            .filter(|(key, instance)| {
                key.name == name
                    && instance.unavailable().is_none()
                    && instance.state() != PluginState::Crashed
            })
            .filter_map(|(key, _)| key.version.as_ref())
            .collect();
        versions.sort_by(|a, b| parse_version(Some(b.as_str())).cmp(&parse_version(Some(a.as_str()))));
        versions.into_iter().cloned().collect()
    }
}

async fn list_dirs(root: &Path) -> Vec<PathBuf> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot read {}: {}", root.display(), e);
            return Vec::new();
        }
    };

    let mut dirs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    dirs
}

/// Lenient semver parse: `v1.2` is read as `1.2.0`.
fn parse_version(version: Option<&str>) -> Option<Version> {
    let version = version?.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() < 3 && parts.iter().all(|p| p.parse::<u64>().is_ok()) {
        let mut padded = parts.join(".");
        for _ in parts.len()..3 {
            padded.push_str(".0");
        }
        return Version::parse(&padded).ok();
    }
    None
}

/// Whether a path segment reads as a version selector.
pub fn is_version(segment: &str) -> bool {
    parse_version(Some(segment)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing;
    use serde_json::json;

    fn supervisor() -> Arc<Supervisor> {
        Arc::new(Supervisor::new(SupervisorConfig {
            host: testing::host(),
            spawn: testing::spawn_options(),
            shutdown_timeout: Duration::from_secs(5),
            internal: testing::internal_registry(),
            log_buffer_lines: 100,
        }))
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version(Some("1.0")), Some(Version::new(1, 0, 0)));
        assert_eq!(parse_version(Some("v2")), Some(Version::new(2, 0, 0)));
        assert_eq!(parse_version(Some("1.2.3")), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version(Some("info")), None);
        assert_eq!(parse_version(None), None);
        assert!(is_version("1.0.0-beta.1"));
        assert!(!is_version("status"));
    }

    #[tokio::test]
    async fn test_discover_reports_problems_and_keeps_going() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        testing::write_internal_plugin(a.path(), "echo", "1.0.0", None);
        testing::write_internal_plugin(a.path(), "echo", "2.0.0", None);
        std::fs::create_dir(a.path().join("not-a-plugin")).unwrap();
        std::fs::create_dir(a.path().join("broken")).unwrap();
        std::fs::write(a.path().join("broken").join(MANIFEST_FILE), "{").unwrap();
        // Same (name, version) under another root.
        testing::write_internal_plugin(b.path(), "echo", "1.0.0", None);

        let supervisor = supervisor();
        let report = supervisor
            .discover(&[a.path().to_path_buf(), b.path().to_path_buf()])
            .await;

        assert_eq!(report.registered, vec!["echo@1.0.0", "echo@2.0.0"]);
        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, PluginError::InvalidManifest { .. })));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, PluginError::DuplicatePlugin { .. })));

        // First root wins.
        let instance = supervisor.resolve("echo", Some("1.0.0")).unwrap();
        assert!(instance.manifest().path.starts_with(std::path::absolute(a.path()).unwrap()));
    }

    #[tokio::test]
    async fn test_discover_plugin_root_and_scoped_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let single = testing::write_plugin(
            tmp.path(),
            "single",
            json!({ "name": "single", "version": "1.0.0" }),
            Some("exit 0"),
        );
        let scoped_root = tmp.path().join("modules");
        testing::write_plugin(
            &scoped_root.join("@appcd"),
            "plugin-android",
            json!({ "name": "@appcd/plugin-android", "version": "3.0.0" }),
            Some("exit 0"),
        );

        let supervisor = supervisor();
        let report = supervisor.discover(&[single, scoped_root]).await;
        assert_eq!(
            report.registered,
            vec!["single@1.0.0", "@appcd/plugin-android@3.0.0"]
        );

        let info = supervisor.resolve("@appcd/plugin-android", None).unwrap().info();
        assert_eq!(info.name, "@appcd/plugin-android");
        assert_eq!(info.package_name, "@appcd/plugin-android");
        assert!(supervisor.resolve("android", None).is_err());
    }

    #[tokio::test]
    async fn test_scoped_and_bare_names_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        testing::write_plugin(
            &tmp.path().join("@a"),
            "plugin-foo",
            json!({ "name": "@a/plugin-foo", "version": "1.0.0" }),
            Some("exit 0"),
        );
        testing::write_plugin(
            tmp.path(),
            "foo",
            json!({ "name": "foo", "version": "1.0.0" }),
            Some("exit 0"),
        );

        let supervisor = supervisor();
        let report = supervisor.discover(&[tmp.path().to_path_buf()]).await;
        assert!(report.errors.is_empty());
        assert_eq!(report.registered.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_versions() {
        let tmp = tempfile::tempdir().unwrap();
        for version in ["1.0.0", "1.10.0", "1.9.0"] {
            testing::write_internal_plugin(tmp.path(), "echo", version, None);
        }
        let supervisor = supervisor();
        supervisor.discover(&[tmp.path().to_path_buf()]).await;

        let latest = supervisor.resolve("echo", None).unwrap();
        assert_eq!(latest.manifest().version.as_deref(), Some("1.10.0"));
        let exact = supervisor.resolve("echo", Some("1.9.0")).unwrap();
        assert_eq!(exact.manifest().version.as_deref(), Some("1.9.0"));
        let prefixed = supervisor.resolve("echo", Some("v1.0.0")).unwrap();
        assert_eq!(prefixed.manifest().version.as_deref(), Some("1.0.0"));
        let short = supervisor.resolve("echo", Some("1.9")).unwrap();
        assert_eq!(short.manifest().version.as_deref(), Some("1.9.0"));

        assert_eq!(
            supervisor.resolve("echo", Some("3.0.0")).unwrap_err(),
            PluginError::NotFound
        );
        assert_eq!(supervisor.resolve("nope", None).unwrap_err(), PluginError::NotFound);
        assert_eq!(supervisor.versions("echo"), vec!["1.10.0", "1.9.0", "1.0.0"]);
    }

    #[tokio::test]
    async fn test_unversioned_resolve_prefers_listed_versions() {
        let tmp = tempfile::tempdir().unwrap();
        testing::write_internal_plugin(tmp.path(), "echo", "1.0.0", None);
        testing::write_internal_plugin(tmp.path(), "echo", "2.0.0", Some("1.2.3"));
        let supervisor = supervisor();
        supervisor.discover(&[tmp.path().to_path_buf()]).await;

        assert_eq!(supervisor.versions("echo"), vec!["1.0.0"]);
        let chosen = supervisor.resolve("echo", None).unwrap();
        assert_eq!(chosen.manifest().version.as_deref(), Some("1.0.0"));

        // Asking for the errored version explicitly still reaches it.
        let errored = supervisor.resolve("echo", Some("2.0.0")).unwrap();
        assert!(errored.unavailable().is_some());

        let only = tempfile::tempdir().unwrap();
        testing::write_internal_plugin(only.path(), "solo", "1.0.0", Some("1.2.3"));
        supervisor.discover(&[only.path().to_path_buf()]).await;
        assert!(supervisor.versions("solo").is_empty());
        assert!(supervisor.resolve("solo", None).unwrap().unavailable().is_some());
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        testing::write_internal_plugin(tmp.path(), "echo", "1.0.0", None);
        let supervisor = supervisor();
        supervisor.discover(&[tmp.path().to_path_buf()]).await;

        let before = supervisor.list();
        supervisor.ensure_loaded("echo", None).await.unwrap();
        assert_eq!(before[0].state, PluginState::Unloaded);
        assert_eq!(supervisor.list()[0].state, PluginState::Started);
    }

    #[tokio::test]
    async fn test_load_errors_reach_every_waiter() {
        let tmp = tempfile::tempdir().unwrap();
        testing::write_internal_plugin(tmp.path(), "echo", "1.0.0", Some("1.2.3"));
        let supervisor = supervisor();
        supervisor.discover(&[tmp.path().to_path_buf()]).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let supervisor = Arc::clone(&supervisor);
            handles.push(tokio::spawn(async move {
                supervisor.ensure_loaded("echo", Some("1.0.0")).await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, PluginError::RuntimeVersionMismatch { .. }));
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_loaded_spawns_once() {
        let tmp = tempfile::tempdir().unwrap();
        let spawns = tmp.path().join("spawns.log");
        testing::write_external_plugin(tmp.path(), "x", "1.0", &spawns);
        let supervisor = supervisor();
        supervisor.discover(&[tmp.path().to_path_buf()]).await;

        let mut handles = Vec::new();
        for _ in 0..50 {
            let supervisor = Arc::clone(&supervisor);
            handles.push(tokio::spawn(async move {
                supervisor.ensure_loaded("x", Some("1.0")).await
            }));
        }

        let mut loaded = Vec::new();
        for handle in handles {
            loaded.push(handle.await.unwrap().unwrap());
        }
        assert!(loaded.iter().all(|i| Arc::ptr_eq(i, &loaded[0])));
        assert_eq!(loaded[0].state(), PluginState::Started);
        assert_eq!(testing::spawn_count(&spawns), 1);

        supervisor.shutdown().await;
        assert_eq!(loaded[0].state(), PluginState::Unloaded);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crashed_version_is_skipped_until_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let spawns = tmp.path().join("spawns.log");
        testing::write_external_plugin(tmp.path(), "android", "1.0.0", &spawns);
        testing::write_external_plugin(tmp.path(), "android", "2.0.0", &spawns);
        let supervisor = supervisor();
        supervisor.discover(&[tmp.path().to_path_buf()]).await;

        let latest = supervisor.ensure_loaded("android", None).await.unwrap();
        assert_eq!(latest.manifest().version.as_deref(), Some("2.0.0"));

        let mut exchange = latest.call("/crash", json!({})).await.unwrap();
        while let Some(envelope) = exchange.next().await {
            if envelope.fin {
                assert_eq!(envelope.status, 500);
                break;
            }
        }
        assert_eq!(latest.state(), PluginState::Crashed);
        assert_eq!(latest.exit_code(), Some(3));
        assert!(supervisor
            .logs()
            .tail("android", 10)
            .iter()
            .any(|l| l.contains("exited unexpectedly")));

        let fallback = supervisor.resolve("android", None).unwrap();
        assert_eq!(fallback.manifest().version.as_deref(), Some("1.0.0"));
        assert!(matches!(
            supervisor.ensure_loaded("android", Some("2.0.0")).await,
            Err(PluginError::Crashed { .. })
        ));
        assert_eq!(supervisor.versions("android"), vec!["1.0.0"]);

        let reloaded = supervisor.reload("android", Some("2.0.0")).await.unwrap();
        assert_eq!(reloaded.state(), PluginState::Started);
        assert_eq!(
            supervisor.resolve("android", None).unwrap().manifest().version.as_deref(),
            Some("2.0.0")
        );

        assert_eq!(supervisor.unload("android", Some("2.0.0")).await.unwrap(), Some(0));
        assert_eq!(reloaded.state(), PluginState::Unloaded);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_internal_plugins_cannot_be_unloaded() {
        let tmp = tempfile::tempdir().unwrap();
        testing::write_internal_plugin(tmp.path(), "echo", "1.0.0", None);
        let supervisor = supervisor();
        supervisor.discover(&[tmp.path().to_path_buf()]).await;
        supervisor.ensure_loaded("echo", None).await.unwrap();

        assert_eq!(
            supervisor.unload("echo", None).await.unwrap_err(),
            PluginError::CannotUnloadInternal
        );
    }
}
