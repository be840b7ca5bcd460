//! Command handlers for the CLI subcommands.

pub mod config_command;
pub mod serve_command;

use crate::cli::{Cli, Commands};

/// Route a parsed CLI invocation to its command handler.
pub async fn dispatch(cli: Cli) -> crate::Result<()> {
    match cli.command {
        Commands::Serve(args) => serve_command::execute(args).await,
        Commands::Config(args) => config_command::execute(args).await,
    }
}
