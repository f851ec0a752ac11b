//! `tollhub` - multi-agency toll aggregation platform.
//!
//! This binary hosts the toll event processing pipeline: agency connector
//! pollers, the staged event bus consumers, statement aggregation and the
//! period-close scheduler.

use anyhow::Result;
use clap::Parser;

use tollhub_core::connector::{AgencyConnector, ConnectorRegistry};
use tollhub_core::{Config, Service, TollHubError};

use crate::cli::{Cli, Commands};

mod cli;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_BUS: i32 = 2;
const EXIT_STORE: i32 = 3;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("configuration error: {err:#}");
            return EXIT_CONFIG;
        }
    };

    match cli.command {
        Commands::ValidateConfig => {
            println!(
                "configuration ok: {} connectors, {} bus partitions per topic",
                config.connectors.len(),
                config.bus.partitions
            );
            EXIT_OK
        }
        Commands::Probe => probe(&config).await,
        Commands::Run => match Service::start(config).await {
            Ok(service) => {
                log::info!("tollhub running, ctrl-c to stop");
                if let Err(err) = tokio::signal::ctrl_c().await {
                    log::error!("failed to listen for shutdown signal: {err}");
                }
                service.shutdown().await;
                EXIT_OK
            }
            Err(err) => {
                log::error!("startup failed: {err}");
                exit_code_for(&err)
            }
        },
    }
}

fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Ok(Config::load(path)?)
    } else {
        log::warn!("config file {path} not found, using defaults + environment");
        Ok(Config::from_env()?)
    }
}

fn exit_code_for(err: &TollHubError) -> i32 {
    match err {
        TollHubError::Configuration { .. } => EXIT_CONFIG,
        TollHubError::BusClosed | TollHubError::UnknownTopic { .. } => EXIT_BUS,
        TollHubError::StoreUnavailable { .. } => EXIT_STORE,
        _ => EXIT_CONFIG,
    }
}

/// One-shot connectivity check against every configured agency.
async fn probe(config: &Config) -> i32 {
    if config.connectors.is_empty() {
        println!("no connectors configured");
        return EXIT_OK;
    }
    let registry = ConnectorRegistry::with_builtins();
    let mut failures = 0;
    for connector_config in &config.connectors {
        let agency = &connector_config.agency_id;
        let connector = match registry.build(connector_config) {
            Ok(connector) => connector,
            Err(err) => {
                println!("{agency}: failed to build connector: {err}");
                failures += 1;
                continue;
            }
        };
        match connector.initialize().await {
            Ok(()) => match connector.health_probe().await {
                Ok(probe) => println!(
                    "{agency}: {} ({}ms, error rate {:.0}%)",
                    probe.status,
                    probe.response_time_ms,
                    probe.error_rate_window * 100.0
                ),
                Err(err) => {
                    println!("{agency}: probe failed: {err}");
                    failures += 1;
                }
            },
            Err(err) => {
                println!("{agency}: initialization failed: {err}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        EXIT_CONFIG
    } else {
        EXIT_OK
    }
}
