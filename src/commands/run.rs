use plugind::clienv;
use plugind::config::DaemonConfig;
use plugind::daemon::DaemonServer;
use plugind::plugin::InternalRegistry;

pub(crate) async fn cmd_run() -> anyhow::Result<()> {
    let config = DaemonConfig::load()?;
    tracing::trace!(config = ?config, "cmd_run invoked");

    println!("Running plugind in foreground (Ctrl+C to stop)");
    println!("  Config: {}", DaemonConfig::config_path().display());
    println!("  Socket: {}", config.socket_path().display());
    println!("  PID:    {}", config.pid_path().display());
    for root in &config.plugin_paths {
        println!("  Plugins: {}", root.display());
    }
    if config.plugin_paths.is_empty() {
        println!("  Plugins: none (set {})", clienv::EnvVar::PlugindPluginPaths.as_str());
    }
    println!();

    let server = DaemonServer::new(config, InternalRegistry::new());
    server.run().await
}
