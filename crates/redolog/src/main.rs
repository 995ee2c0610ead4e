//! redolog: inspect redo log segments and the segment archive.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use redolog_core::{Config, LogFormat};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;
mod commands;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("redolog {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    init_logging(&config)?;
    redolog_storage::init_redolog_metrics();

    let mut out = io::stdout().lock();
    match cli.command {
        Commands::Verify(args) => commands::handle_verify(&args, &mut out),
        Commands::Archive(args) => commands::handle_archive(&config, &args, &mut out),
        Commands::Info(args) => commands::handle_info(&args, &mut out),
        Commands::Version => Ok(()),
    }
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    Config::load(path.as_deref()).context("Failed to load configuration")
}

/// Logs go to stderr; stdout carries the report.
fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }

    Ok(())
}
