use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while discovering, loading and talking to plugins.
///
/// Every variant carries owned strings only so a single load failure can be
/// cloned out to all callers waiting on the same named mutex.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("Not a plugin: {}", dir.display())]
    NotAPlugin { dir: PathBuf, reason: String },

    #[error("Invalid plugin manifest {}: {reason}", path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("Unable to find main file: {main}")]
    EntryPointNotFound { main: String },

    #[error("Internal plugin requires runtime {required}, but the daemon is running {current}")]
    RuntimeVersionMismatch { required: String, current: String },

    #[error("Unsupported platform \"{platform}\"")]
    PlatformUnsupported { platform: String },

    #[error("Plugin {name}@{version} is already registered from {}", existing.display())]
    DuplicatePlugin {
        name: String,
        version: String,
        existing: PathBuf,
    },

    #[error("Failed to spawn plugin host for {plugin}: {reason}")]
    SpawnError { plugin: String, reason: String },

    #[error("Cannot unload internal plugins")]
    CannotUnloadInternal,

    #[error("Not Found")]
    NotFound,

    #[error("Plugin {plugin} crashed (exit code {})", exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    Crashed {
        plugin: String,
        exit_code: Option<i32>,
    },

    #[error("{reason}")]
    Unavailable { reason: String },

    #[error("No internal plugin factory registered for {name}")]
    MissingInternalFactory { name: String },

    #[error("Plugin {plugin} did not become ready within {secs}s")]
    StartupTimeout { plugin: String, secs: u64 },

    #[error("Plugin transport error: {0}")]
    Transport(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),
}

impl PluginError {
    /// Numeric status carried by the error envelope that reports this failure.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound | Self::NotAPlugin { .. } => 404,
            Self::PlatformUnsupported { .. }
            | Self::RuntimeVersionMismatch { .. }
            | Self::EntryPointNotFound { .. }
            | Self::Unavailable { .. } => 503,
            _ => 500,
        }
    }

    /// Short machine-readable code, used in logs and the `stack` field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAPlugin { .. } => "NotAPlugin",
            Self::InvalidManifest { .. } => "InvalidManifest",
            Self::EntryPointNotFound { .. } => "EntryPointNotFound",
            Self::RuntimeVersionMismatch { .. } => "RuntimeVersionMismatch",
            Self::PlatformUnsupported { .. } => "PlatformUnsupported",
            Self::DuplicatePlugin { .. } => "DuplicatePlugin",
            Self::SpawnError { .. } => "SpawnError",
            Self::CannotUnloadInternal => "CannotUnloadInternal",
            Self::NotFound => "NotFound",
            Self::Crashed { .. } => "Crashed",
            Self::Unavailable { .. } => "Unavailable",
            Self::MissingInternalFactory { .. } => "MissingInternalFactory",
            Self::StartupTimeout { .. } => "StartupTimeout",
            Self::Transport(_) => "Transport",
            Self::Aborted(_) => "Aborted",
        }
    }
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        PluginError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        PluginError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
