//! CLI commands for tollhub.

use clap::{Parser, Subcommand};

/// tollhub - multi-agency toll event processing pipeline
#[derive(Parser)]
#[command(name = "tollhub")]
#[command(about = "Toll Hub - agency connectors, event pipeline, statements")]
#[command(version)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "tollhub.yaml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline service until interrupted
    Run,
    /// Load and validate the configuration, then exit
    ValidateConfig,
    /// One-shot health probe of every configured agency connector
    Probe,
}
