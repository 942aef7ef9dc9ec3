use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

use wsbridge_core::config::BridgeConfig;

#[derive(Parser)]
#[command(name = "wsbridge", version, about = "Trusted WebSocket reverse proxy for overlay-network clients")]
struct Cli {
    /// Path to a TOML config file; built-in defaults are used if omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy in the foreground until a shutdown signal is received.
    Serve,
    /// Load and validate the config file, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::CheckConfig => {
            let config = BridgeConfig::load(cli.config.as_deref())?;
            println!(
                "config OK: listening on {}, health on {}, upstream {}",
                config.listen_addr, config.health_addr, config.upstream_url
            );
        }
        Commands::Serve => {
            wsbridge_proxy::init_tracing();
            let config = BridgeConfig::load(cli.config.as_deref())?;
            let shutdown = CancellationToken::new();
            let drain = CancellationToken::new();
            wsbridge_proxy::serve(config, cli.config.clone(), shutdown, drain).await?;
        }
    }

    Ok(())
}
