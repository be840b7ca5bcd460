//! Arguments for the `serve` subcommand.

use clap::Args;
use std::path::PathBuf;

/// Run the transcription service.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to the configuration file (defaults to the user config dir,
    /// overridable with WHISPERD_CONFIG_PATH)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}
