//! Command line definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Courier - publish transmission service
#[derive(Parser, Debug)]
#[command(name = "courier", author, version, about = "Publish transmission service")]
pub struct Cli {
    /// Configuration file; defaults to `config/default` plus `config/{COURIER_ENV}`
    #[arg(short, long, global = true, env = "COURIER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "COURIER_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run migrations, transmit workers and the dispatch scheduler
    Serve(ServeArgs),

    /// Request one batch run immediately and exit
    Transmit(TransmitArgs),

    /// Run pending database migrations and exit
    Migrate,
}

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Use in-process locks and task queue instead of Redis (single node only)
    #[arg(long)]
    pub local: bool,

    /// Only transmit items of this delivery type
    #[arg(long, env = "COURIER_PROVIDER_TYPE")]
    pub provider_type: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct TransmitArgs {
    /// Only transmit items of this delivery type
    #[arg(long)]
    pub provider_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable multi-line
    #[default]
    Pretty,
    /// JSON lines
    Json,
    /// Single-line
    Compact,
}
