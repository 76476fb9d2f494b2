//! Certwarden - Main entry point
//!
//! Loads configuration, seeds zones and runs the certificate manager until
//! interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use certwarden::acme::{Http01Challenges, InstantAcmeProvider};
use certwarden::{CertificateManager, CertificateRepository, CertificateService};
use certwarden_config::{Config, ZoneMode};
use certwarden_store::MemoryDataStore;

/// Certwarden - certificate lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "certwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTWARDEN_CONFIG", global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long = "json", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file and exit
    Check,
    /// Run the certificate manager (default)
    Run,
    /// Run one operator command against a freshly seeded store
    Exec {
        /// Command name, e.g. `zones` or `issue`
        name: String,
        /// Command arguments
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let config = load_config(cli.config.as_deref())?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    match cli.command {
        Some(Commands::Check) => check_config(&config, cli.config.as_deref()),
        Some(Commands::Exec { name, args }) => runtime.block_on(exec_command(config, name, args)),
        Some(Commands::Run) | None => runtime.block_on(run_manager(config)),
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            Config::from_file(path).context("Failed to load configuration file")?
        }
        None => {
            info!("No configuration specified, using defaults");
            Config::default()
        }
    };
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

/// Summarise a validated configuration
fn check_config(config: &Config, path: Option<&str>) -> Result<()> {
    let acme_zones = config.zones.iter().filter(|z| z.mode == ZoneMode::Acme).count();

    info!("Configuration test successful:");
    info!("  - {} zone(s), {} via ACME", config.zones.len(), acme_zones);
    info!("  - ACME directory {}", config.acme.directory());
    info!("  - default signer '{}'", config.self_signed.signer);

    if acme_zones > 0 && !config.acme.accept_tos {
        warn!("ACME zones are configured but the terms of service are not accepted");
    }

    println!(
        "certwarden: configuration {} test is successful",
        path.unwrap_or("(defaults)")
    );
    Ok(())
}

async fn build_manager(config: Config) -> Result<CertificateManager> {
    let config = Arc::new(config);
    let repo = CertificateRepository::new(Arc::new(MemoryDataStore::new()));
    let acme = InstantAcmeProvider::new(&config.acme, Http01Challenges::new());
    let service = CertificateService::new(repo, Arc::new(acme), config.clone());

    service
        .seed_zones(&config.zones)
        .await
        .context("Failed to seed zones")?;

    Ok(CertificateManager::new(Arc::new(service)))
}

async fn exec_command(config: Config, name: String, args: Vec<String>) -> Result<()> {
    let manager = build_manager(config).await?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = manager
        .execute_command(&name, &args)
        .await
        .with_context(|| format!("Command '{}' failed", name))?;
    println!("{}", output.trim_end());
    Ok(())
}

async fn run_manager(config: Config) -> Result<()> {
    let manager = build_manager(config).await?;
    manager
        .start()
        .await
        .context("Failed to start certificate manager")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    manager.shutdown().await;
    Ok(())
}
