//! Trunknet CLI Tool
//!
//! A command-line interface for provisioning trunknet address pools and
//! inspecting the attachments the CNI plugin has recorded. Talks to the
//! same store, with the same keys, as the plugin itself.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Pool(cmd) => commands::pool::run(cmd)?,
        Commands::Attachments(cmd) => commands::attachments::run(cmd)?,
    }

    Ok(())
}
