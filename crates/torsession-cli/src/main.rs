//! Command-line supervisor for a local Tor daemon.
//!
//! Launches a tor process with a private control socket, authenticates
//! over it, and reports bootstrap progress, proxy configuration, and
//! circuit snapshots.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// Supervise a local Tor daemon over its control socket
#[derive(Parser)]
#[command(name = "torsession")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "~/.torsession")]
    data_dir: String,

    /// Tor executable to launch
    #[arg(long, default_value = "tor")]
    tor_binary: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch tor and keep the session alive until interrupted
    Run {
        /// GeoIP database file passed to the daemon
        #[arg(long)]
        geoip: Option<String>,

        /// IPv6 GeoIP database file passed to the daemon
        #[arg(long)]
        geoip6: Option<String>,
    },

    /// Launch tor, print its SOCKS proxy configuration, and exit
    Proxy,

    /// Launch tor, wait for connectivity, and print its circuits
    Circuits {
        /// GeoIP database file passed to the daemon
        #[arg(long)]
        geoip: Option<String>,

        /// IPv6 GeoIP database file passed to the daemon
        #[arg(long)]
        geoip6: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let data_dir = shellexpand::tilde(&cli.data_dir).to_string();

    match cli.command {
        Commands::Run { geoip, geoip6 } => {
            commands::run(&data_dir, &cli.tor_binary, geoip.as_deref(), geoip6.as_deref()).await?;
        }
        Commands::Proxy => {
            commands::proxy(&data_dir, &cli.tor_binary).await?;
        }
        Commands::Circuits { geoip, geoip6 } => {
            commands::circuits(&data_dir, &cli.tor_binary, geoip.as_deref(), geoip6.as_deref())
                .await?;
        }
    }

    Ok(())
}
