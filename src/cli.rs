use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Deepthink CLI definition.
#[derive(Debug, Parser)]
#[command(name = "deepthink")]
#[command(about = "Local MCP server for deep-thinking workflows", version)]
pub struct Cli {
    /// Tracing filter, e.g. "deepthink=debug" (RUST_LOG overrides).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Verbose stderr logging.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Emit stderr logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the MCP server on stdio until stdin closes.
    Serve(ServeArgs),
    /// Load and validate a configuration file, then exit.
    Validate(ValidateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ServeArgs {
    #[arg(
        long,
        default_value = "config.yaml",
        help = "Path to the flows/templates configuration file"
    )]
    pub config: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct ValidateArgs {
    #[arg(
        long,
        default_value = "config.yaml",
        help = "Path to the flows/templates configuration file"
    )]
    pub config: PathBuf,
}
