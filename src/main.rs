//! Shadowbox - remote sandbox execution service.
//!
//! Usage:
//!   shadowbox serve [--config cloud.config.json] [--port 8080]

use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shadowbox::config::Config;
use shadowbox::gateway;

#[derive(Parser, Debug)]
#[command(name = "shadowbox")]
#[command(about = "Remote sandbox execution service")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket gateway
    Serve {
        /// Path to a JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve { config, port } => {
            let mut config = match config {
                Some(path) => match Config::load(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        exit(1);
                    }
                },
                None => Config::default(),
            };
            if let Some(port) = port {
                config.api.port = port;
            }

            if let Err(e) = gateway::run_server(config).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
    }
}
