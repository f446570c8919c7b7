pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;
pub mod mutex;
pub mod plugin;

pub use config::DaemonConfig;
pub use error::{PluginError, Result};
pub use plugin::{PluginManifest, Supervisor, SupervisorConfig};
