use serde_json::Value;

pub(crate) async fn cmd_logcat(plugin: Option<&str>) -> anyhow::Result<()> {
    let path = match plugin {
        Some(plugin) => format!("/daemon/logcat/{}", plugin),
        None => "/daemon/logcat".to_string(),
    };

    let client = super::client()?;
    let mut stream = client.request(&path, Value::Null).await?;

    loop {
        let envelope = tokio::select! {
            envelope = stream.next() => envelope?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(envelope) = envelope else { break };
        if envelope.is_error() {
            anyhow::bail!("logcat failed: {}", envelope.message);
        }
        let source = envelope.message["plugin"].as_str().unwrap_or("?");
        if let Some(line) = envelope.message["line"].as_str() {
            println!("[{}] {}", source, line);
        }
    }

    stream.cancel().await.ok();
    Ok(())
}
