//! Deepthink entry point and composition root.
//!
//! Wires the application by:
//! 1. Parsing CLI arguments
//! 2. Initializing tracing (stderr plus a debug log file)
//! 3. Loading the configuration snapshot and opening the store
//! 4. Handing the service to the stdio MCP adapter

use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;

use deepthink::{
    Cli, Commands, config,
    core::ports::SystemClock,
    server::McpServer,
    service::ThinkingService,
    tracing_setup,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = tracing_setup::init(cli.verbose, cli.log_json, cli.log_level.as_deref());

    let result = match cli.command {
        Commands::Serve(args) => serve_command(&args).await,
        Commands::Validate(args) => validate_command(&args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("command failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve_command(args: &deepthink::cli::ServeArgs) -> Result<()> {
    let service = ThinkingService::bootstrap(&args.config, Arc::new(SystemClock::new()))
        .with_context(|| format!("starting from config {}", args.config.display()))?;
    let server = McpServer::new(Arc::new(service));
    server.run_stdio().await
}

fn validate_command(args: &deepthink::cli::ValidateArgs) -> Result<()> {
    let snapshot = config::load(&args.config)
        .with_context(|| format!("validating {}", args.config.display()))?;
    println!(
        "OK: {} flows, {} templates, default flow '{}'",
        snapshot.flows.len(),
        snapshot.templates.list().len(),
        snapshot.server.default_flow
    );
    for (flow_type, flow) in &snapshot.flows {
        println!("  flow '{}': {} steps", flow_type, flow.steps.len());
    }
    Ok(())
}
