use std::path::PathBuf;

macro_rules! env_vars {
    ($($variant:ident => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum EnvVar {
            $($variant),*
        }

        impl EnvVar {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(EnvVar::$variant => $name),*
                }
            }
        }
    };
}

env_vars! {
    PlugindConfigDir      => "PLUGIND_CONFIG_DIR",
    PlugindSocket         => "PLUGIND_SOCKET",
    PlugindPid            => "PLUGIND_PID",
    PlugindPluginPaths    => "PLUGIND_PLUGIN_PATHS",
    PlugindRuntimeVersion => "PLUGIND_RUNTIME_VERSION",
    PlugindInterpreter    => "PLUGIND_INTERPRETER",
    PlugindTcpPort        => "PLUGIND_TCP_PORT",
}

const FALLBACK_CONFIG_DIR: &str = ".config";
const FALLBACK_DATA_DIR: &str = ".local/share";
const PLUGIND_SUBDIR: &str = "plugind";
const DEFAULT_TCP_PORT: u16 = 14732;

/// Value of an environment variable, treating empty as unset.
pub fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Config directory ($PLUGIND_CONFIG_DIR or ~/.config/plugind)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(EnvVar::PlugindConfigDir.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| home_dir().join(FALLBACK_CONFIG_DIR))
                .join(PLUGIND_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Data directory (~/.local/share/plugind)
pub fn data_dir() -> PathBuf {
    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| home_dir().join(FALLBACK_DATA_DIR))
        .join(PLUGIND_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Home directory, or the system temp directory when there is none.
fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(std::env::temp_dir)
}

/// Default plugin root (~/.local/share/plugind/plugins)
pub fn plugins_dir() -> PathBuf {
    data_dir().join("plugins")
}

/// Daemon socket path ($PLUGIND_SOCKET or ~/.local/share/plugind/daemon.sock)
pub fn daemon_socket_path() -> PathBuf {
    let path = env_opt(EnvVar::PlugindSocket.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("daemon.sock"));
    tracing::trace!(path = %path.display(), "Daemon socket path");
    path
}

/// Daemon PID file path ($PLUGIND_PID or ~/.local/share/plugind/daemon.pid)
pub fn daemon_pid_path() -> PathBuf {
    let path = env_opt(EnvVar::PlugindPid.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("daemon.pid"));
    tracing::trace!(path = %path.display(), "Daemon PID path");
    path
}

/// Plugin roots override ($PLUGIND_PLUGIN_PATHS, OS path-list syntax)
pub fn plugin_paths() -> Option<Vec<PathBuf>> {
    let val = env_opt(EnvVar::PlugindPluginPaths.as_str()).map(|v| parse_path_list(&v));
    tracing::trace!(value = ?val, "PLUGIND_PLUGIN_PATHS env var");
    val
}

/// Runtime version override ($PLUGIND_RUNTIME_VERSION)
pub fn runtime_version() -> Option<String> {
    let val = env_opt(EnvVar::PlugindRuntimeVersion.as_str());
    tracing::trace!(value = ?val, "PLUGIND_RUNTIME_VERSION env var");
    val
}

/// Interpreter for external plugin hosts ($PLUGIND_INTERPRETER)
pub fn interpreter() -> Option<PathBuf> {
    let val = env_opt(EnvVar::PlugindInterpreter.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "PLUGIND_INTERPRETER env var");
    val
}

/// Daemon TCP port for non-Unix platforms ($PLUGIND_TCP_PORT or 14732)
pub fn daemon_tcp_port() -> u16 {
    env_opt(EnvVar::PlugindTcpPort.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_TCP_PORT)
}

fn parse_path_list(value: &str) -> Vec<PathBuf> {
    std::env::split_paths(value)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}
