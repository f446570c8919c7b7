use plugind::DaemonConfig;
use std::time::Duration;

pub(crate) async fn cmd_stop() -> anyhow::Result<()> {
    let config = DaemonConfig::load()?;
    let client = plugind::daemon::DaemonClient::with_socket(config.socket_path());

    if !client.is_running().await {
        println!("plugind is not running");
        return Ok(());
    }

    println!("Stopping plugind gracefully...");
    client.shutdown().await?;

    // Wait for the daemon to release its socket
    let socket = config.socket_path();
    for _ in 0..100 {
        if !socket.exists() {
            println!("plugind stopped");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("plugind may still be stopping (check with `plugind status`)");
    Ok(())
}
