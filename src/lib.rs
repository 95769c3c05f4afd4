#![warn(clippy::uninlined_format_args)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod expr;
pub mod output;
pub mod paths;
pub mod persistence;
pub mod server;
pub mod service;
pub mod sessions;
pub mod templates;
pub mod tracing_setup;

pub use cli::{Cli, Commands};
pub use service::ThinkingService;
