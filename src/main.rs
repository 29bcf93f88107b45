//! Zentinel gRPC Mock - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_grpc_mock::{MockFleet, MockServerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "zentinel-grpc-mock",
    about = "gRPC mock server - dynamic services from .proto files with rule-based stubbing",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "grpc-mock.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print default config if requested
    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    }
    info!(path = ?args.config, "Loading configuration");
    let config = MockServerConfig::from_file(&args.config)?;

    // Validate and exit if requested
    if args.validate {
        println!(
            "Configuration is valid ({} endpoints, {} rules defined)",
            config.endpoints.len(),
            config.rules.len()
        );
        return Ok(());
    }

    let rules = config.to_rules()?;
    let fleet = MockFleet::new(config.fleet_settings());
    let ports = fleet.start_all(config.endpoint_specs()).await?;

    for rule in rules {
        if let Err(e) = fleet.add_rule(rule).await {
            fleet.stop_all().await;
            return Err(e.into());
        }
    }

    info!(ports = ?ports, "Mock fleet running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    fleet.stop_all().await;

    Ok(())
}
