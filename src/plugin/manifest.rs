use crate::error::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// File every plugin directory must contain.
pub const MANIFEST_FILE: &str = "package.json";

/// Entry point used when the manifest has no `main`.
pub const DEFAULT_MAIN: &str = "index";

/// Where a plugin's code runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Inside the daemon process, via a registered factory.
    Internal,
    /// In a supervised child process.
    External,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Internal => "internal",
            PluginKind::External => "external",
        }
    }
}

/// Facts about the running daemon that manifests are validated against.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    /// Version of the host runtime, compared with `engines.node`.
    pub runtime_version: String,
    /// Current OS name as reported by `std::env::consts::OS`.
    pub platform: String,
}

impl HostEnvironment {
    pub fn current() -> Self {
        Self {
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
        }
    }

    pub fn with_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = version.into();
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Whether `declared` (as written in a manifest) names this platform.
    fn platform_matches(&self, declared: &str) -> bool {
        let declared = match declared {
            "darwin" => "macos",
            "win32" => "windows",
            other => other,
        };
        declared == self.platform
    }
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self::current()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    main: Option<String>,
    engines: Option<RawEngines>,
    appcd: Option<RawPluginSection>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEngines {
    node: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPluginSection {
    #[serde(rename = "type")]
    kind: Option<String>,
    os: Option<Vec<String>>,
}

/// Immutable description of one plugin directory.
#[derive(Debug, Clone)]
pub struct PluginManifest {
    /// The `name` field exactly as written, e.g. `@appcd/plugin-android`.
    pub name: String,
    pub version: Option<String>,
    /// Absolute plugin directory.
    pub path: PathBuf,
    pub kind: PluginKind,
    /// Runtime version constraint, defaulting to the host's own version.
    pub required_runtime_version: String,
    /// Absolute path of the main executable file.
    pub entry_point: PathBuf,
    /// Platforms the plugin declares support for. Empty means all.
    pub platforms: Vec<String>,
    pub supported: bool,
    error: Option<PluginError>,
}

impl PluginManifest {
    /// Read and validate the manifest in `dir`.
    ///
    /// Problems that still leave a usable descriptor (runtime mismatch,
    /// unsupported platform, missing main file) are recorded on the returned
    /// manifest instead of failing the load.
    pub fn load(dir: &Path, host: &HostEnvironment) -> Result<Self> {
        if !dir.is_dir() {
            return Err(PluginError::NotAPlugin {
                dir: dir.to_path_buf(),
                reason: "directory does not exist".to_string(),
            });
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(PluginError::NotAPlugin {
                dir: dir.to_path_buf(),
                reason: format!("directory does not contain a {MANIFEST_FILE}"),
            });
        }

        trace!(path = %manifest_path.display(), "Reading plugin manifest");
        let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
            PluginError::InvalidManifest {
                path: manifest_path.clone(),
                reason: e.to_string(),
            }
        })?;
        let raw: RawManifest =
            serde_json::from_str(&content).map_err(|e| PluginError::InvalidManifest {
                path: manifest_path.clone(),
                reason: e.to_string(),
            })?;

        let name = raw
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| PluginError::InvalidManifest {
                path: manifest_path.clone(),
                reason: "manifest doesn't have a name".to_string(),
            })?;

        let path = std::path::absolute(dir).map_err(|e| PluginError::NotAPlugin {
            dir: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let plugin = raw.appcd.unwrap_or_default();
        let kind = match plugin.kind.as_deref() {
            Some("internal") => PluginKind::Internal,
            _ => PluginKind::External,
        };

        let required_runtime_version = raw
            .engines
            .and_then(|e| e.node)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| host.runtime_version.clone());

        let main = raw.main.unwrap_or_else(|| DEFAULT_MAIN.to_string());
        let entry_point = resolve_entry_point(&path, &main);

        let platforms = plugin.os.unwrap_or_default();
        let supported = platforms.is_empty() || platforms.iter().any(|p| host.platform_matches(p));

        let mut error = None;
        if kind == PluginKind::Internal
            && !runtime_satisfies(&host.runtime_version, &required_runtime_version)
        {
            error = Some(PluginError::RuntimeVersionMismatch {
                required: required_runtime_version.clone(),
                current: host.runtime_version.clone(),
            });
        } else if !supported {
            error = Some(PluginError::PlatformUnsupported {
                platform: host.platform.clone(),
            });
        } else if !entry_point.is_file() {
            error = Some(PluginError::EntryPointNotFound { main });
        }

        let manifest = Self {
            name,
            version: raw.version.filter(|v| !v.trim().is_empty()),
            path,
            kind,
            required_runtime_version,
            entry_point,
            platforms,
            supported,
            error,
        };

        debug!(
            name = %manifest.name,
            version = ?manifest.version,
            kind = manifest.kind.as_str(),
            error = ?manifest.error.as_ref().map(|e| e.to_string()),
            "Loaded plugin manifest"
        );
        Ok(manifest)
    }

    /// Problem recorded while loading, if any. Such a plugin never starts.
    pub fn error(&self) -> Option<&PluginError> {
        self.error.as_ref()
    }

    /// `name@version` label used for logging and mutex keys.
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version.as_deref().unwrap_or("null"))
    }
}

fn resolve_entry_point(dir: &Path, main: &str) -> PathBuf {
    let mut file = PathBuf::from(main);
    let ext = std::env::consts::EXE_EXTENSION;
    if !ext.is_empty() && file.extension().is_none() {
        file.set_extension(ext);
    }
    if file.is_absolute() {
        file
    } else {
        dir.join(file)
    }
}

/// Whether `current` satisfies the `engines.node` range `required`.
///
/// Ranges follow npm conventions: `||` separates alternatives, comparators
/// within one are space separated, `a - b` is inclusive, and a bare version
/// pins it (`1.2.3` is exact, `1.2` is any `1.2.x`). A constraint or version
/// that fails to parse never matches.
fn runtime_satisfies(current: &str, required: &str) -> bool {
    let current = current.trim().trim_start_matches('v');
    let Ok(current) = semver::Version::parse(current) else {
        return false;
    };
    required.split("||").any(|alternative| {
        to_version_req(alternative)
            .and_then(|req| semver::VersionReq::parse(&req).ok())
            .is_some_and(|req| req.matches(&current))
    })
}

/// Rewrite one npm range alternative in `semver::VersionReq` syntax.
fn to_version_req(alternative: &str) -> Option<String> {
    let tokens: Vec<&str> = alternative.split_whitespace().collect();
    match tokens.as_slice() {
        [] => Some("*".to_string()),
        [low, "-", high] => Some(format!(
            ">={}, <={}",
            low.trim_start_matches('v'),
            high.trim_start_matches('v')
        )),
        comparators => {
            let mut out = Vec::with_capacity(comparators.len());
            for comparator in comparators {
                if comparator.starts_with(['^', '~', '<', '>', '=']) {
                    out.push(comparator.replace(['v', ' '], ""));
                    continue;
                }
                let bare = comparator.trim_start_matches('v');
                if bare.is_empty() {
                    return None;
                }
                if bare.split('.').any(|part| matches!(part, "x" | "X" | "*")) {
                    out.push(bare.to_string());
                } else {
                    out.push(format!("={bare}"));
                }
            }
            Some(out.join(", "))
        }
    }
}
