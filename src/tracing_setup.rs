use std::fs;

use tracing_subscriber::{
    EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::paths;

/// Initializes the tracing subscriber with layered output:
/// 1. Stderr: human-readable by default, JSON with `--log-json`. Stdout is
///    reserved for the MCP protocol and never receives log lines.
/// 2. File: JSON debug logs under `<data_dir>/logs/deepthink.log`.
///
/// Returns a WorkerGuard that must be held by main() so file logs flush.
pub fn init(
    verbose: bool,
    log_json: bool,
    log_level: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stderr_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match log_level {
            Some(spec) => EnvFilter::try_new(spec).unwrap_or_else(|_| default_env_filter(verbose)),
            None => default_env_filter(verbose),
        },
    };

    let (file_layer, guard) = {
        let log_dir = paths::data_dir().join("logs");
        if let Err(e) = fs::create_dir_all(&log_dir) {
            eprintln!("Warning: failed to create log dir {log_dir:?}: {e}");
            (None, None)
        } else {
            let file_appender = tracing_appender::rolling::never(&log_dir, "deepthink.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(
                    tracing_subscriber::filter::Targets::new()
                        .with_default(tracing::Level::DEBUG),
                );
            (Some(layer), Some(guard))
        }
    };

    let stderr_layer: Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> = if log_json {
        Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else if verbose {
        Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .without_time()
                .with_target(false)
                .with_level(true)
                .with_filter(stderr_filter),
        )
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn default_env_filter(verbose: bool) -> EnvFilter {
    let spec = if verbose {
        "deepthink=debug,info"
    } else {
        "deepthink=info,warn"
    };
    EnvFilter::new(spec)
}
