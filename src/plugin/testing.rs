//! Fixtures shared by the plugin and daemon tests.

use super::host::SpawnOptions;
use super::internal::{InternalPlugin, InternalRegistry};
use super::manifest::{HostEnvironment, PluginManifest, MANIFEST_FILE};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn host() -> HostEnvironment {
    HostEnvironment::current()
        .with_runtime_version("2.0.0")
        .with_platform("linux")
}

pub(crate) fn spawn_options() -> SpawnOptions {
    SpawnOptions {
        interpreter: Some(PathBuf::from("/bin/sh")),
        startup_timeout: Duration::from_secs(10),
        kill_grace: Duration::from_millis(500),
        env: Vec::new(),
    }
}

pub(crate) fn internal_registry() -> InternalRegistry {
    InternalRegistry::new().with("echo", |_m: &PluginManifest| {
        let plugin = |path: &str, data: &Value| {
            Ok::<_, anyhow::Error>(json!({ "path": path, "data": data }))
        };
        Ok(Arc::new(plugin) as Arc<dyn InternalPlugin>)
    })
}

/// Write `<root>/<dir>/package.json` and, if given, an `index` script.
pub(crate) fn write_plugin(root: &Path, dir: &str, manifest: Value, script: Option<&str>) -> PathBuf {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(MANIFEST_FILE), manifest.to_string()).unwrap();
    if let Some(script) = script {
        let mut main = dir.join("index");
        let ext = std::env::consts::EXE_EXTENSION;
        if !ext.is_empty() {
            main.set_extension(ext);
        }
        std::fs::write(main, format!("#!/bin/sh\n{script}\n")).unwrap();
    }
    dir
}

pub(crate) fn write_internal_plugin(
    root: &Path,
    name: &str,
    version: &str,
    runtime: Option<&str>,
) -> PathBuf {
    let mut manifest = json!({
        "name": name,
        "version": version,
        "appcd": { "type": "internal" }
    });
    if let Some(runtime) = runtime {
        manifest["engines"] = json!({ "node": runtime });
    }
    write_plugin(root, &format!("{name}-{version}"), manifest, Some(""))
}

/// A host that appends its PID to `spawn_log` on every start.
///
/// `/crash` exits with code 3, `/hang` never answers, `/stream` emits three
/// events before the final response, `/ticks` emits an event every 50ms for
/// ten seconds, and anything else answers `{"pong":true}`.
pub(crate) fn write_external_plugin(root: &Path, name: &str, version: &str, spawn_log: &Path) -> PathBuf {
    let script = format!(
        r#"echo $$ >> '{log}'
echo "host {name} booting" >&2
echo '{{"type":"ready"}}'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"type":"shutdown"'*)
      echo '{{"type":"shutdown-ack"}}'
      exit 0
      ;;
    *'"type":"cancel"'*) ;;
    *'"path":"/crash"'*) exit 3 ;;
    *'"path":"/hang"'*) ;;
    *'"path":"/ticks"'*)
      (
        n=0
        while [ $n -lt 200 ]; do
          echo "{{\"type\":\"event\",\"id\":$id,\"message\":$n}}"
          n=$((n + 1))
          sleep 0.05
        done
        echo "{{\"type\":\"response\",\"id\":$id,\"fin\":true,\"message\":\"done\"}}"
      ) &
      ;;
    *'"path":"/stream"'*)
      for n in 1 2 3; do
        echo "{{\"type\":\"event\",\"id\":$id,\"message\":$n}}"
      done
      echo "{{\"type\":\"response\",\"id\":$id,\"fin\":true,\"message\":\"done\"}}"
      ;;
    *)
      echo "{{\"type\":\"response\",\"id\":$id,\"fin\":true,\"message\":{{\"pong\":true}}}}"
      ;;
  esac
done
"#,
        log = spawn_log.display(),
    );
    write_plugin(
        root,
        &format!("{name}-{version}"),
        json!({ "name": name, "version": version, "appcd": { "type": "external" } }),
        Some(&script),
    )
}

/// Number of hosts started by plugins written with [`write_external_plugin`].
pub(crate) fn spawn_count(spawn_log: &Path) -> usize {
    std::fs::read_to_string(spawn_log)
        .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}
