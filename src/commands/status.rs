use plugind::daemon::HealthStatus;
use plugind::plugin::PluginInfo;

pub(crate) async fn cmd_status(json: bool) -> anyhow::Result<()> {
    let client = super::client()?;

    let status = match client.status().await {
        Ok(status) => status,
        Err(e) => {
            tracing::debug!("Status request failed: {:#}", e);
            println!("plugind is not running");
            println!("  Run `plugind run` to start the daemon");
            return Ok(());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let plugins: Vec<PluginInfo> = serde_json::from_value(status["plugins"].clone())?;
    let health = HealthStatus::from_plugins(&plugins);

    println!("plugind v{}", status["version"].as_str().unwrap_or("?"));
    println!("  PID:     {}", status["pid"]);
    println!("  Uptime:  {}", format_duration(status["uptime"].as_u64().unwrap_or(0)));
    println!(
        "  Runtime: {} ({})",
        status["runtimeVersion"].as_str().unwrap_or("?"),
        status["platform"].as_str().unwrap_or("?")
    );
    println!(
        "  Plugins: {} registered, {} started, {} crashed",
        health.total, health.started, health.crashed
    );
    println!();

    if plugins.is_empty() {
        println!("  No plugins registered");
        return Ok(());
    }

    let rows: Vec<[String; 6]> = plugins
        .iter()
        .map(|p| {
            [
                p.name.clone(),
                p.version.clone().unwrap_or_else(|| "-".to_string()),
                p.kind.as_str().to_string(),
                p.state.to_string(),
                p.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string()),
                format!("{}/{}", p.active_requests, p.total_requests),
            ]
        })
        .collect();
    print_table(["Plugin", "Version", "Type", "State", "PID", "Requests"], &rows);

    for plugin in plugins.iter().filter(|p| p.error.is_some()) {
        println!(
            "  ! {}: {}",
            plugin.name,
            plugin.error.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

fn print_table(header: [&str; 6], rows: &[[String; 6]]) {
    let mut widths = header.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: [&str; 6]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        println!("  {}", padded.join("  ").trim_end());
    };

    line(header);
    for row in rows {
        line(row.each_ref().map(String::as_str));
    }
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
