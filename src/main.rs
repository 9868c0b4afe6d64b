//! ContentShield gateway server
//!
//! Usage:
//!   content-shield [--config <path>] [--bind <address>]
//!
//! Loads the configuration, seeds the store from the configured catalog,
//! resumes blur jobs a previous run left behind and serves protected URLs
//! until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use content_shield::jobs::TokioScheduler;
use content_shield::logging::init_logging;
use content_shield::{open_ledger, ContentShield, GatewayServer, MemoryStore, ProtectionConfig};

/// Command line arguments
struct Args {
    /// Configuration file, merged over the defaults
    config: Option<PathBuf>,
    /// Overrides `server.bind_address`
    bind: Option<String>,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut args = std::env::args().skip(1);
        let mut config = None;
        let mut bind = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = Some(args.next().map(PathBuf::from).ok_or("--config needs a path")?);
                }
                "--bind" | "-b" => {
                    bind = Some(args.next().ok_or("--bind needs an address")?);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {
                    return Err(format!("Unknown argument: {}", arg));
                }
            }
        }

        Ok(Self { config, bind })
    }
}

fn print_help() {
    println!(
        r#"ContentShield gateway

USAGE:
    content-shield [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file (TOML, JSON or YAML)
    -b, --bind <ADDRESS>    Socket address to listen on
    -h, --help              Print help information

Settings can also be given as CONTENT_SHIELD__<SECTION>__<FIELD> environment variables."#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(2);
        }
    };

    let mut config = ProtectionConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    let _logging = init_logging(config.logging.clone()).context("initializing logging")?;
    tracing::info!("Starting ContentShield...");

    let store = Arc::new(match &config.catalog {
        Some(path) => MemoryStore::from_catalog_file(path)
            .with_context(|| format!("loading catalog {}", path.display()))?,
        None => {
            tracing::warn!("No catalog configured; starting with an empty store");
            MemoryStore::new()
        }
    });

    let ledger = open_ledger(&config.ledger).await.context("opening watermark ledger")?;
    let scheduler = Arc::new(TokioScheduler::current().context("no tokio runtime")?);

    let shield = ContentShield::new(config.clone(), store.clone(), store.clone(), ledger, scheduler)?;

    let resumed = shield.jobs().recover_interrupted(store.item_ids())?;
    tracing::info!("Resumed {} blur jobs", resumed);

    let shield = Arc::new(shield);
    let sweeper = {
        let shield = shield.clone();
        let interval = Duration::from_secs(config.cache.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match shield.sweep_cache().await {
                    Ok(report) => tracing::debug!(
                        "Maintenance: {} derivatives expired, {} ledger records pruned",
                        report.cache.expired,
                        report.ledger_pruned
                    ),
                    Err(e) => tracing::warn!("Maintenance sweep failed: {}", e),
                }
            }
        })
    };

    let server = GatewayServer::new(shield.gateway().clone(), &config.server)?;
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    sweeper.abort();
    tracing::info!("ContentShield stopped");
    Ok(())
}
