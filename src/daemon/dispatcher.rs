//! Routes request paths to daemon services or plugin instances and relays
//! the resulting envelopes.

use super::health::HealthStatus;
use super::log_buffer::LogLine;
use super::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::error::PluginError;
use crate::plugin::{PluginInstance, Supervisor};
use crate::plugin::supervisor::is_version;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// First path segment of the built-in services.
pub const SERVICE_NAMESPACE: &str = "daemon";

/// Envelopes buffered per dispatch before the relay waits on the consumer.
const STREAM_CAPACITY: usize = 64;

/// Buffered lines replayed when a logcat stream starts.
const LOGCAT_BACKLOG: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/daemon/<segments...>`
    Service(Vec<String>),
    Plugin {
        name: String,
        version: Option<String>,
        /// Remainder with a leading `/`, or empty.
        subpath: String,
    },
}

/// Split a request path into its route. `None` for an empty path.
pub fn parse_route(path: &str) -> Option<Route> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let first = segments.next()?;

    if first == SERVICE_NAMESPACE {
        return Some(Route::Service(segments.map(str::to_string).collect()));
    }

    let mut rest: Vec<&str> = segments.collect();
    let name = match first.starts_with('@') && !rest.is_empty() {
        true => format!("{}/{}", first, rest.remove(0)),
        false => first.to_string(),
    };
    let version = match rest.first() {
        Some(segment) if is_version(segment) => Some(rest.remove(0).to_string()),
        _ => None,
    };
    let subpath = if rest.is_empty() {
        String::new()
    } else {
        format!("/{}", rest.join("/"))
    };

    Some(Route::Plugin {
        name,
        version,
        subpath,
    })
}

/// `<name>[/<version>]` from service path segments, where `name` may be a
/// scoped `@scope/name` pair.
fn plugin_target<'a>(segments: &[&'a str]) -> Option<(String, Option<&'a str>)> {
    match segments {
        [scope, name, version @ ..] if scope.starts_with('@') && version.len() <= 1 => {
            Some((format!("{scope}/{name}"), version.first().copied()))
        }
        [name, version @ ..] if !name.starts_with('@') && version.len() <= 1 => {
            Some((name.to_string(), version.first().copied()))
        }
        _ => None,
    }
}

/// Envelopes produced by one dispatch, ending with the `fin` envelope.
///
/// Dropping the stream or calling [`cancel`](Self::cancel) stops the relay
/// and cancels the request on the plugin side.
pub struct ResponseStream {
    rx: mpsc::Receiver<ResponseEnvelope>,
    done: bool,
}

impl ResponseStream {
    pub async fn next(&mut self) -> Option<ResponseEnvelope> {
        if self.done {
            return None;
        }
        let envelope = self.rx.recv().await?;
        if envelope.fin {
            self.done = true;
        }
        Some(envelope)
    }

    pub fn cancel(mut self) {
        self.rx.close();
    }

    /// Drain everything up to and including the `fin` envelope.
    pub async fn collect(mut self) -> Vec<ResponseEnvelope> {
        let mut envelopes = Vec::new();
        while let Some(envelope) = self.next().await {
            envelopes.push(envelope);
        }
        envelopes
    }
}

struct Relay {
    id: u64,
    tx: mpsc::Sender<ResponseEnvelope>,
}

impl Relay {
    /// False once the consumer has gone away.
    async fn send(&self, envelope: ResponseEnvelope) -> bool {
        self.tx.send(envelope.with_id(self.id)).await.is_ok()
    }

    async fn finish(&self, envelope: ResponseEnvelope) {
        let _ = self.send(envelope.with_fin(true)).await;
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

enum Step {
    Envelope(Option<ResponseEnvelope>),
    Cancelled,
}

pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    config: Value,
    started_at: Instant,
    version: String,
    shutdown: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            supervisor,
            config: Value::Null,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shutdown,
        }
    }

    /// Effective configuration reported by `/daemon/config`.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Flips to `true` when the daemon has been asked to stop.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Start handling `request` on its own task.
    pub fn dispatch(self: &Arc<Self>, request: RequestEnvelope) -> ResponseStream {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let relay = Relay { id: request.id, tx };
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.route(request, relay).await });
        ResponseStream { rx, done: false }
    }

    async fn route(&self, request: RequestEnvelope, relay: Relay) {
        debug!(id = request.id, path = %request.path, stream = request.stream, "Dispatching request");
        match parse_route(&request.path) {
            None => relay.finish(ResponseEnvelope::not_found()).await,
            Some(Route::Service(segments)) => {
                let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
                self.handle_service(&segments, &relay).await
            }
            Some(Route::Plugin {
                name,
                version,
                subpath,
            }) => {
                self.handle_plugin(&name, version.as_deref(), &subpath, request.data, &relay)
                    .await
            }
        }
    }

    async fn handle_plugin(
        &self,
        name: &str,
        version: Option<&str>,
        subpath: &str,
        data: Value,
        relay: &Relay,
    ) {
        if version.is_none() && subpath.is_empty() {
            let versions = self.supervisor.versions(name);
            let envelope = if versions.is_empty() {
                ResponseEnvelope::not_found()
            } else {
                ResponseEnvelope::ok(json!(versions))
            };
            return relay.finish(envelope).await;
        }

        let instance = match self.supervisor.resolve(name, version) {
            Ok(instance) => instance,
            Err(e) => {
                debug!("No plugin for {}@{:?}: {}", name, version, e);
                return relay.finish(ResponseEnvelope::from_error(&e)).await;
            }
        };

        if let Some(err) = instance.unavailable() {
            debug!("Plugin {} is unavailable: {}", instance.label(), err);
            return relay.finish(ResponseEnvelope::from_error(&err)).await;
        }

        let instance = match self.supervisor.load(instance).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!("Failed to load plugin {}@{:?}: {}", name, version, e);
                return relay.finish(ResponseEnvelope::from_error(&e)).await;
            }
        };

        if subpath.is_empty() {
            instance.begin_request().finish();
            let info = instance.info();
            let envelope = match serde_json::to_value(info) {
                Ok(info) => ResponseEnvelope::ok(info),
                Err(e) => ResponseEnvelope::from_error(&PluginError::from(e)),
            };
            return relay.finish(envelope).await;
        }

        self.forward(&instance, subpath, data, relay).await;
    }

    async fn forward(&self, instance: &Arc<PluginInstance>, subpath: &str, data: Value, relay: &Relay) {
        let guard = instance.begin_request();
        let label = instance.label();

        let mut exchange = match instance.call(subpath, data).await {
            Ok(exchange) => exchange,
            Err(e) => {
                guard.finish();
                return relay.finish(ResponseEnvelope::from_error(&e)).await;
            }
        };
        trace!("Forwarded {} to {}", subpath, label);

        loop {
            let step = tokio::select! {
                envelope = exchange.next() => Step::Envelope(envelope),
                _ = relay.closed() => Step::Cancelled,
            };

            match step {
                Step::Envelope(Some(envelope)) if envelope.fin => {
                    guard.finish();
                    relay.send(envelope).await;
                    return;
                }
                Step::Envelope(Some(envelope)) => {
                    if !relay.send(envelope).await {
                        debug!("Consumer of {} {} went away", label, subpath);
                        exchange.cancel().await;
                        return;
                    }
                }
                Step::Envelope(None) => {
                    guard.finish();
                    warn!("Plugin {} ended {} without a final response", label, subpath);
                    return relay
                        .finish(ResponseEnvelope::error(
                            500,
                            format!("Plugin {label} ended the request without a response"),
                        ))
                        .await;
                }
                Step::Cancelled => {
                    debug!("Request {} {} cancelled", label, subpath);
                    exchange.cancel().await;
                    return;
                }
            }
        }
    }

    async fn handle_service(&self, segments: &[&str], relay: &Relay) {
        trace!("Daemon service {:?}", segments);
        let envelope = match segments {
            ["status"] => ResponseEnvelope::ok(self.status()),
            ["health"] => {
                let health = HealthStatus::from_plugins(&self.supervisor.list());
                ResponseEnvelope::ok(json!(health))
            }
            ["config"] => ResponseEnvelope::ok(self.config.clone()),
            ["plugin"] | ["plugin", "registered"] => ResponseEnvelope::ok(json!(self.supervisor.list())),
            ["logcat"] => return self.logcat(None, relay).await,
            ["logcat", rest @ ..] => match plugin_target(rest) {
                Some((plugin, None)) => return self.logcat(Some(plugin.as_str()), relay).await,
                _ => ResponseEnvelope::not_found(),
            },
            ["plugin", "reload", rest @ ..] => match plugin_target(rest) {
                Some((name, version)) => match self.supervisor.reload(&name, version).await {
                    Ok(instance) => ResponseEnvelope::ok(json!(instance.info())),
                    Err(e) => ResponseEnvelope::from_error(&e),
                },
                None => ResponseEnvelope::not_found(),
            },
            ["plugin", "unload", rest @ ..] => match plugin_target(rest) {
                Some((name, version)) => match self.supervisor.unload(&name, version).await {
                    Ok(exit_code) => ResponseEnvelope::ok(json!({ "exitCode": exit_code })),
                    Err(e) => ResponseEnvelope::from_error(&e),
                },
                None => ResponseEnvelope::not_found(),
            },
            ["shutdown"] => {
                info!("Shutdown requested by client");
                self.request_shutdown();
                ResponseEnvelope::ok("Shutting down")
            }
            _ => ResponseEnvelope::not_found(),
        };
        relay.finish(envelope).await;
    }

    fn status(&self) -> Value {
        let host = self.supervisor.host();
        json!({
            "version": self.version,
            "pid": std::process::id(),
            "uptime": self.started_at.elapsed().as_secs(),
            "runtimeVersion": host.runtime_version,
            "platform": host.platform,
            "plugins": self.supervisor.list(),
        })
    }

    async fn logcat(&self, plugin: Option<&str>, relay: &Relay) {
        let logs = self.supervisor.logs();
        let mut feed = logs.subscribe();

        let backlog = match plugin {
            Some(plugin) => logs
                .tail(plugin, LOGCAT_BACKLOG)
                .into_iter()
                .map(|line| LogLine {
                    plugin: plugin.to_string(),
                    line,
                })
                .collect(),
            None => logs.tail_all(LOGCAT_BACKLOG),
        };
        for line in backlog {
            if !relay.send(ResponseEnvelope::event(json!(line))).await {
                return;
            }
        }

        loop {
            let received = tokio::select! {
                line = feed.recv() => line,
                _ = relay.closed() => {
                    debug!("Logcat stream cancelled");
                    return;
                }
            };
            match received {
                Ok(line) => {
                    if plugin.is_some_and(|p| p != line.plugin) {
                        continue;
                    }
                    if !relay.send(ResponseEnvelope::event(json!(line))).await {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Logcat follower lagged, skipped {} line(s)", skipped);
                }
                Err(RecvError::Closed) => {
                    return relay.finish(ResponseEnvelope::ok(Value::Null)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::EnvelopeType;
    use crate::plugin::{testing, PluginState, SupervisorConfig};
    use std::time::Duration;

    async fn dispatcher(roots: &[std::path::PathBuf]) -> Arc<Dispatcher> {
        let supervisor = Arc::new(Supervisor::new(SupervisorConfig {
            host: testing::host(),
            spawn: testing::spawn_options(),
            shutdown_timeout: Duration::from_secs(5),
            internal: testing::internal_registry(),
            log_buffer_lines: 100,
        }));
        supervisor.discover(roots).await;
        Arc::new(Dispatcher::new(supervisor).with_config(json!({ "pluginPaths": [] })))
    }

    async fn request(dispatcher: &Arc<Dispatcher>, path: &str) -> Vec<ResponseEnvelope> {
        dispatcher
            .dispatch(RequestEnvelope::new(path).id(7).data(json!({})))
            .collect()
            .await
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_parse_route() {
        assert_eq!(parse_route("/"), None);
        assert_eq!(
            parse_route("/daemon/plugin/registered"),
            Some(Route::Service(vec!["plugin".into(), "registered".into()]))
        );
        assert_eq!(
            parse_route("/android/1.2.3/info/sdk"),
            Some(Route::Plugin {
                name: "android".into(),
                version: Some("1.2.3".into()),
                subpath: "/info/sdk".into(),
            })
        );
        assert_eq!(
            parse_route("/android/info?x=1"),
            Some(Route::Plugin {
                name: "android".into(),
                version: None,
                subpath: "/info".into(),
            })
        );
        assert_eq!(
            parse_route("/@appcd/plugin-ios/1.0.0/info"),
            Some(Route::Plugin {
                name: "@appcd/plugin-ios".into(),
                version: Some("1.0.0".into()),
                subpath: "/info".into(),
            })
        );
        assert_eq!(
            plugin_target(&["@appcd", "plugin-ios", "1.0.0"]),
            Some(("@appcd/plugin-ios".to_string(), Some("1.0.0")))
        );
        assert_eq!(plugin_target(&["echo"]), Some(("echo".to_string(), None)));
        assert_eq!(plugin_target(&["echo", "1.0.0", "extra"]), None);
        assert_eq!(
            parse_route("/android/1.0"),
            Some(Route::Plugin {
                name: "android".into(),
                version: Some("1.0".into()),
                subpath: String::new(),
            })
        );
    }

    #[tokio::test]
    async fn test_unregistered_path_is_404() {
        let dispatcher = dispatcher(&[]).await;
        for path in ["/nope/1.0.0/info", "/nope/info", "/nope", "", "/daemon/bogus"] {
            let envelopes = request(&dispatcher, path).await;
            assert_eq!(envelopes.len(), 1, "{path}");
            assert_eq!(envelopes[0].status, 404);
            assert_eq!(envelopes[0].kind, EnvelopeType::Error);
            assert_eq!(envelopes[0].message, json!("Not Found"));
            assert!(envelopes[0].fin);
            assert_eq!(envelopes[0].id, Some(7));
        }
    }

    #[tokio::test]
    async fn test_internal_plugin_request() {
        let tmp = tempfile::tempdir().unwrap();
        testing::write_internal_plugin(tmp.path(), "echo", "1.0.0", None);
        let dispatcher = dispatcher(&[tmp.path().to_path_buf()]).await;

        let envelopes = request(&dispatcher, "/echo/1.0.0/hello/world").await;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].status, 200);
        assert_eq!(envelopes[0].message["path"], "/hello/world");

        let envelopes = request(&dispatcher, "/echo").await;
        assert_eq!(envelopes[0].message, json!(["1.0.0"]));
    }

    #[tokio::test]
    async fn test_info_endpoint_counts_as_request() {
        let tmp = tempfile::tempdir().unwrap();
        testing::write_internal_plugin(tmp.path(), "echo", "1.0.0", None);
        let dispatcher = dispatcher(&[tmp.path().to_path_buf()]).await;

        let envelopes = request(&dispatcher, "/echo/1.0.0").await;
        let info = &envelopes[0].message;
        assert_eq!(envelopes[0].status, 200);
        assert_eq!(info["name"], "echo");
        assert_eq!(info["type"], "internal");
        assert_eq!(info["state"], "started");
        assert_eq!(info["nodeVersion"], "2.0.0");
        assert_eq!(info["totalRequests"], 1);
        assert_eq!(info["activeRequests"], 0);
        assert!(info["error"].is_null());
    }

    #[tokio::test]
    async fn test_runtime_mismatch_yields_error_envelope() {
        let tmp = tempfile::tempdir().unwrap();
        testing::write_internal_plugin(tmp.path(), "echo", "1.0.0", Some("1.2.3"));
        let dispatcher = dispatcher(&[tmp.path().to_path_buf()]).await;

        for path in ["/echo/1.0.0/hi", "/echo/1.0.0", "/echo/hi"] {
            let envelopes = request(&dispatcher, path).await;
            assert_eq!(envelopes.len(), 1);
            assert_eq!(envelopes[0].status, 503);
            assert!(envelopes[0].is_error());
            assert!(envelopes[0].message.as_str().unwrap().contains("1.2.3"));
        }
        let instance = dispatcher.supervisor().resolve("echo", None).unwrap();
        assert_eq!(instance.state(), PluginState::Unloaded);
        assert_eq!(instance.total_requests(), 0);
        // Errored plugins are not offered as dispatch targets.
        assert_eq!(request(&dispatcher, "/echo").await[0].status, 404);
    }

    #[tokio::test]
    async fn test_unsupported_platform_never_200() {
        let tmp = tempfile::tempdir().unwrap();
        testing::write_plugin(
            tmp.path(),
            "ios",
            json!({ "name": "@appcd/plugin-ios", "version": "1.0.0", "appcd": { "os": ["darwin"] } }),
            Some("exit 0"),
        );
        let dispatcher = dispatcher(&[tmp.path().to_path_buf()]).await;

        let envelopes = request(&dispatcher, "/@appcd/plugin-ios/1.0.0/info").await;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].status, 503);
        assert_eq!(envelopes[0].message, json!("Unsupported platform \"linux\""));

        // Still visible to introspection.
        let registered = request(&dispatcher, "/daemon/plugin/registered").await;
        let plugins = registered[0].message.as_array().unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0]["supported"], false);
        assert_eq!(plugins[0]["packageName"], "@appcd/plugin-ios");
    }

    #[tokio::test]
    async fn test_daemon_services() {
        let tmp = tempfile::tempdir().unwrap();
        testing::write_internal_plugin(tmp.path(), "echo", "1.0.0", None);
        let dispatcher = dispatcher(&[tmp.path().to_path_buf()]).await;

        let status = request(&dispatcher, "/daemon/status").await;
        assert_eq!(status[0].status, 200);
        assert_eq!(status[0].message["pid"], std::process::id());
        assert_eq!(status[0].message["plugins"].as_array().unwrap().len(), 1);

        let health = request(&dispatcher, "/daemon/health").await;
        assert_eq!(health[0].message["total"], 1);

        let config = request(&dispatcher, "/daemon/config").await;
        assert_eq!(config[0].message, json!({ "pluginPaths": [] }));

        let unload = request(&dispatcher, "/daemon/plugin/unload/echo/1.0.0").await;
        assert_eq!(unload[0].status, 500);
        assert!(unload[0].stack.as_deref().unwrap().starts_with("CannotUnloadInternal"));

        let reload = request(&dispatcher, "/daemon/plugin/reload/echo").await;
        assert_eq!(reload[0].status, 200);
        assert_eq!(reload[0].message["state"], "started");

        let mut signal = dispatcher.shutdown_signal();
        let stop = request(&dispatcher, "/daemon/shutdown").await;
        assert_eq!(stop[0].status, 200);
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
    }

    #[tokio::test]
    async fn test_logcat_streams_until_cancelled() {
        let dispatcher = dispatcher(&[]).await;
        let logs = Arc::clone(dispatcher.supervisor().logs());
        logs.push("android", "old line".into());
        logs.push("ios", "other plugin".into());

        let mut stream = dispatcher.dispatch(RequestEnvelope::new("/daemon/logcat/android").streaming(true));
        let first = stream.next().await.unwrap();
        assert_eq!(first.kind, EnvelopeType::Event);
        assert!(!first.fin);
        assert_eq!(first.message["line"], "old line");

        logs.push("ios", "ignored".into());
        logs.push("android", "new line".into());
        let second = stream.next().await.unwrap();
        assert_eq!(second.message["plugin"], "android");
        assert_eq!(second.message["line"], "new line");

        stream.cancel();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_happy_path() {
        let tmp = tempfile::tempdir().unwrap();
        let spawns = tmp.path().join("spawns.log");
        testing::write_external_plugin(tmp.path(), "android", "1.0.0", &spawns);
        let dispatcher = dispatcher(&[tmp.path().to_path_buf()]).await;

        let envelopes = request(&dispatcher, "/android/1.0.0/info").await;
        let last = envelopes.last().unwrap();
        assert!(last.fin);
        assert_eq!(last.status, 200);
        assert_eq!(last.id, Some(7));

        let streamed = request(&dispatcher, "/android/1.0.0/stream").await;
        assert_eq!(streamed.len(), 4);
        assert_eq!(streamed.iter().filter(|e| e.fin).count(), 1);
        assert!(streamed.last().unwrap().fin);

        let instance = dispatcher.supervisor().resolve("android", Some("1.0.0")).unwrap();
        assert_eq!(instance.total_requests(), 2);
        assert_eq!(instance.active_requests(), 0);
        assert_eq!(testing::spawn_count(&spawns), 1);

        dispatcher.supervisor().shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_releases_request_without_stopping_plugin() {
        let tmp = tempfile::tempdir().unwrap();
        let spawns = tmp.path().join("spawns.log");
        testing::write_external_plugin(tmp.path(), "android", "1.0.0", &spawns);
        let dispatcher = dispatcher(&[tmp.path().to_path_buf()]).await;

        let stream = dispatcher.dispatch(RequestEnvelope::new("/android/hang"));
        let instance = dispatcher.supervisor().resolve("android", None).unwrap();
        wait_for(|| instance.active_requests() == 1).await;

        stream.cancel();
        wait_for(|| instance.active_requests() == 0).await;
        assert_eq!(instance.state(), PluginState::Started);

        // The host keeps serving.
        let envelopes = request(&dispatcher, "/android/ping").await;
        assert_eq!(envelopes.last().unwrap().status, 200);

        dispatcher.supervisor().shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_fails_in_flight_and_next_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let spawns = tmp.path().join("spawns.log");
        testing::write_external_plugin(tmp.path(), "android", "1.0.0", &spawns);
        let dispatcher = dispatcher(&[tmp.path().to_path_buf()]).await;

        let hanging = dispatcher.dispatch(RequestEnvelope::new("/android/1.0.0/hang"));
        let instance = dispatcher.supervisor().resolve("android", None).unwrap();
        wait_for(|| instance.active_requests() == 1).await;

        let crashed = request(&dispatcher, "/android/1.0.0/crash").await;
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].status, 500);

        let orphaned = hanging.collect().await;
        assert_eq!(orphaned.len(), 1);
        assert!(orphaned[0].fin);
        assert_eq!(orphaned[0].status, 500);

        assert_eq!(instance.state(), PluginState::Crashed);
        assert_eq!(instance.active_requests(), 0);

        let after = request(&dispatcher, "/android/1.0.0/info").await;
        assert_eq!(after[0].status, 500);
        assert!(after[0].stack.as_deref().unwrap().starts_with("Crashed"));
    }
}
