use crate::clienv;
use crate::plugin::{HostEnvironment, SpawnOptions, SupervisorConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon settings from `config.toml`, with environment overrides applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DaemonConfig {
    /// Directories scanned for plugins
    pub plugin_paths: Vec<PathBuf>,
    /// Runtime version reported to plugins and checked against `engines.node`
    pub runtime_version: Option<String>,
    /// Program used to run external plugin entry points
    pub interpreter: Option<PathBuf>,
    pub startup_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Captured host output kept per plugin
    pub log_buffer_lines: usize,
    pub socket_path: Option<PathBuf>,
    pub pid_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            plugin_paths: vec![clienv::plugins_dir()],
            runtime_version: None,
            interpreter: None,
            startup_timeout_secs: 30,
            shutdown_timeout_secs: 10,
            log_buffer_lines: 10_000,
            socket_path: None,
            pid_path: None,
        }
    }
}

impl DaemonConfig {
    /// $PLUGIND_CONFIG_DIR/config.toml or ~/.config/plugind/config.toml
    pub fn config_path() -> PathBuf {
        clienv::config_dir().join("config.toml")
    }

    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading daemon config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(
            plugin_paths = ?config.plugin_paths,
            runtime_version = ?config.runtime_version,
            "Daemon config loaded"
        );
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(paths) = clienv::plugin_paths() {
            self.plugin_paths = paths;
        }
        if let Some(version) = clienv::runtime_version() {
            self.runtime_version = Some(version);
        }
        if let Some(interpreter) = clienv::interpreter() {
            self.interpreter = Some(interpreter);
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(clienv::daemon_socket_path)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.pid_path.clone().unwrap_or_else(clienv::daemon_pid_path)
    }

    pub fn host_environment(&self) -> HostEnvironment {
        let host = HostEnvironment::current();
        match &self.runtime_version {
            Some(version) => host.with_runtime_version(version.clone()),
            None => host,
        }
    }

    /// Supervisor settings derived from this config. Internal plugin
    /// factories are registered by the embedding binary.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            host: self.host_environment(),
            spawn: SpawnOptions {
                interpreter: self.interpreter.clone(),
                startup_timeout: Duration::from_secs(self.startup_timeout_secs),
                ..SpawnOptions::default()
            },
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            log_buffer_lines: self.log_buffer_lines,
            ..SupervisorConfig::default()
        }
    }
}
