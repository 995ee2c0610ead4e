//! CLI argument parsing for redolog.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Redo log inspection tool.
#[derive(Parser)]
#[command(name = "redolog")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Decode segment files and print one line per record.
    Verify(VerifyArgs),

    /// List the archived segments of the configured log.
    Archive(ArchiveArgs),

    /// Print the header and record counts of a segment file.
    Info(InfoArgs),

    /// Print version information.
    Version,
}

/// Arguments for the verify command.
#[derive(Args)]
pub struct VerifyArgs {
    /// Only print records logged by this server (repeatable).
    #[arg(long = "server-id", value_name = "ID")]
    pub server_ids: Vec<String>,

    /// Print only the begin and end markers of each file.
    #[arg(short, long)]
    pub quiet: bool,

    /// Segment files to verify.
    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<PathBuf>,
}

/// Arguments for the archive command.
#[derive(Args)]
pub struct ArchiveArgs {
    /// Only list segments with at least this sequence number.
    #[arg(long, value_name = "SEQ")]
    pub from: Option<i64>,

    /// Output format (text, json).
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for the info command.
#[derive(Args)]
pub struct InfoArgs {
    /// Segment file to inspect.
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Output format (text, json).
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for CLI commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}
