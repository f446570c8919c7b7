use anyhow::Context;
use serde_json::Value;

pub(crate) async fn cmd_exec(path: &str, data: Option<&str>) -> anyhow::Result<()> {
    let data = match data {
        Some(raw) => serde_json::from_str(raw).context("--data must be valid JSON")?,
        None => Value::Null,
    };
    tracing::trace!(path = %path, data = %data, "cmd_exec invoked");

    let client = super::client()?;
    let mut stream = client.request(path, data).await?;

    let mut failed = false;
    while let Some(envelope) = stream.next().await? {
        failed |= envelope.is_error();
        println!("{}", serde_json::to_string(&envelope)?);
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
