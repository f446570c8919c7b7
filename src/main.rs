mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run => commands::run::cmd_run().await?,
        Commands::Exec { path, data } => commands::exec::cmd_exec(&path, data.as_deref()).await?,
        Commands::Status { json } => commands::status::cmd_status(json).await?,
        Commands::Logcat { plugin } => commands::logcat::cmd_logcat(plugin.as_deref()).await?,
        Commands::Stop => commands::stop::cmd_stop().await?,
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}
