//! CLI definition using clap
//!
//! Defines the command-line interface structure for the trunknet operator
//! tool.

use clap::{Parser, Subcommand};

/// Trunknet CLI - operator tool for the trunknet CNI plugin
#[derive(Parser, Debug)]
#[command(name = "trunknet")]
#[command(version)]
#[command(about = "Inspect and provision trunknet pools and attachments", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage allocation pools
    #[command(subcommand, about = "Inspect or seed per-group address pools")]
    Pool(PoolCommands),

    /// Inspect attachment records
    #[command(subcommand, about = "Inspect recorded container attachments")]
    Attachments(AttachmentCommands),
}

/// Pool subcommands
#[derive(Subcommand, Debug)]
pub enum PoolCommands {
    /// Show the remaining pool of a group
    #[command(about = "Show the remaining addresses of a group's pool")]
    Show(PoolShowArgs),

    /// Replace the pool of a group
    #[command(about = "Replace a group's pool with the given addresses")]
    Set(PoolSetArgs),
}

/// Arguments for the pool show command
#[derive(Parser, Debug)]
pub struct PoolShowArgs {
    /// Allocation group name
    #[arg(value_name = "GROUP", help = "Allocation group to show")]
    pub group: String,

    /// Output in JSON format
    #[arg(long, help = "Output the pool in JSON format")]
    pub json: bool,
}

/// Arguments for the pool set command
#[derive(Parser, Debug)]
pub struct PoolSetArgs {
    /// Allocation group name
    #[arg(value_name = "GROUP", help = "Allocation group to write")]
    pub group: String,

    /// Pool entries in hand-out order
    #[arg(
        value_name = "CIDR",
        required = true,
        value_delimiter = ',',
        help = "Addresses in CIDR notation, first entry handed out first"
    )]
    pub cidrs: Vec<String>,
}

/// Attachment subcommands
#[derive(Subcommand, Debug)]
pub enum AttachmentCommands {
    /// List all recorded attachments
    #[command(about = "List every recorded attachment")]
    List(AttachmentListArgs),

    /// Show one attachment record
    #[command(about = "Show the full record of one container")]
    Show(AttachmentShowArgs),
}

/// Arguments for the attachments list command
#[derive(Parser, Debug)]
pub struct AttachmentListArgs {
    /// Output in JSON format
    #[arg(long, help = "Output attachments in JSON format")]
    pub json: bool,
}

/// Arguments for the attachments show command
#[derive(Parser, Debug)]
pub struct AttachmentShowArgs {
    /// Container id, in full or as a unique prefix
    #[arg(value_name = "CONTAINER", help = "Container id or unique prefix")]
    pub container: String,

    /// Output in JSON format
    #[arg(long, help = "Output the record in JSON format")]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_pool_set_splits_on_comma() {
        let cli =
            Cli::try_parse_from(["trunknet", "pool", "set", "g1", "10.0.4.5/23,10.0.4.6/23"])
                .unwrap();
        match cli.command {
            Commands::Pool(PoolCommands::Set(args)) => {
                assert_eq!(args.group, "g1");
                assert_eq!(args.cidrs, vec!["10.0.4.5/23", "10.0.4.6/23"]);
            }
            _ => panic!("parsed into the wrong command"),
        }
    }

    #[test]
    fn test_pool_set_requires_entries() {
        assert!(Cli::try_parse_from(["trunknet", "pool", "set", "g1"]).is_err());
    }

    #[test]
    fn test_attachments_show_takes_prefix() {
        let cli = Cli::try_parse_from(["trunknet", "attachments", "show", "abc123", "--json"])
            .unwrap();
        match cli.command {
            Commands::Attachments(AttachmentCommands::Show(args)) => {
                assert_eq!(args.container, "abc123");
                assert!(args.json);
            }
            _ => panic!("parsed into the wrong command"),
        }
    }
}
