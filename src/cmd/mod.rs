//! CLI command handlers

use clap::Subcommand;

pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file and exit
    CheckConfig,
}
