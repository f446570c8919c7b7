use crate::plugin::{PluginInfo, PluginState};
use serde::{Deserialize, Serialize};

/// Health status summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Total number of registered plugins
    pub total: usize,
    pub started: usize,
    pub unloaded: usize,
    /// Starting or stopping
    pub transitioning: usize,
    pub crashed: usize,
    /// Supported plugins with a recorded error
    pub errored: usize,
    /// Plugins declaring a different platform
    pub unsupported: usize,
    /// Plugins that need attention (crashed or errored)
    pub unhealthy: Vec<String>,
}

impl HealthStatus {
    pub fn from_plugins(plugins: &[PluginInfo]) -> Self {
        let mut status = HealthStatus {
            total: plugins.len(),
            ..Default::default()
        };

        for plugin in plugins {
            let label = format!(
                "{}@{}",
                plugin.name,
                plugin.version.as_deref().unwrap_or("null")
            );
            match plugin.state {
                PluginState::Started => status.started += 1,
                PluginState::Unloaded => status.unloaded += 1,
                PluginState::Starting | PluginState::Stopping => status.transitioning += 1,
                PluginState::Crashed => {
                    status.crashed += 1;
                    status.unhealthy.push(label.clone());
                }
            }

            if !plugin.supported {
                status.unsupported += 1;
            } else if plugin.error.is_some() {
                status.errored += 1;
                if !status.unhealthy.contains(&label) {
                    status.unhealthy.push(label);
                }
            }
        }

        status
    }

    /// Check if all plugins are healthy
    pub fn is_healthy(&self) -> bool {
        self.crashed == 0 && self.unhealthy.is_empty()
    }
}
