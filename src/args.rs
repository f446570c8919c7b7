use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "plugind")]
#[command(version)]
#[command(about = "Plugin daemon: discovers, supervises and routes requests to plugins", long_about = None)]
pub(crate) struct Cli {
    /// Log filter used when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the daemon in the foreground
    Run,

    /// Send a request to the running daemon and print every response
    Exec {
        /// Request path (e.g. /android/1.0.0/info or /daemon/status)
        path: String,

        /// JSON request payload
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Show daemon status and registered plugins
    Status {
        /// Print the raw status JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream captured plugin host output
    Logcat {
        /// Only show lines from this plugin
        plugin: Option<String>,
    },

    /// Stop the running daemon
    Stop,
}
