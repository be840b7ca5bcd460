//! Command-line interface for the whisperd service.
//!
//! This module provides the top-level CLI application structure and
//! subcommands for running the transcription service and inspecting its
//! configuration.
//!
//! # Architecture
//!
//! The CLI is built using `clap` and follows a subcommand pattern:
//! - `serve` - run the task processor until interrupted
//! - `config` - print the effective configuration or its file path
//!
//! # Examples
//!
//! ```bash
//! # Run the service with the default configuration
//! whisperd serve
//!
//! # Run against an explicit configuration file
//! whisperd serve --config /etc/whisperd/config.toml
//!
//! # Show the effective configuration
//! whisperd config show
//! ```

mod config_args;
mod serve_args;

use clap::{Parser, Subcommand};
pub use config_args::{ConfigAction, ConfigArgs};
pub use serve_args::ServeArgs;

/// Main CLI application structure defining the top-level interface.
#[derive(Parser, Debug)]
#[command(name = "whisperd")]
#[command(about = "Asynchronous speech-to-text task service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands for the whisperd binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the transcription service until interrupted
    Serve(ServeArgs),

    /// Manage and inspect application configuration
    Config(ConfigArgs),
}

/// Executes the whisperd CLI with parsed arguments.
///
/// Routes parsed command-line arguments to their respective command
/// handlers; errors are propagated up to `main` for proper exit code
/// handling.
pub async fn run() -> crate::Result<()> {
    let cli = Cli::parse();
    crate::commands::dispatch(cli).await
}
