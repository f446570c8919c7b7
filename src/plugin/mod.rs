//! Plugin discovery, lifecycle and supervision.

pub mod host;
pub mod instance;
pub mod internal;
pub mod manifest;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use host::SpawnOptions;
pub use instance::{PluginInfo, PluginInstance, PluginState, RequestGuard};
pub use internal::{InternalFactory, InternalPlugin, InternalRegistry};
pub use manifest::{HostEnvironment, PluginKind, PluginManifest};
pub use supervisor::{DiscoveryReport, Supervisor, SupervisorConfig};
