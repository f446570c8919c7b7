pub(crate) mod exec;
pub(crate) mod logcat;
pub(crate) mod run;
pub(crate) mod status;
pub(crate) mod stop;

use plugind::daemon::DaemonClient;
use plugind::DaemonConfig;

/// Client for the socket the configured daemon listens on.
pub(crate) fn client() -> anyhow::Result<DaemonClient> {
    let config = DaemonConfig::load()?;
    Ok(DaemonClient::with_socket(config.socket_path()))
}
