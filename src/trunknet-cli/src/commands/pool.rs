//! Pool commands
//!
//! Reads and writes the comma-joined pool value the plugin allocates
//! from, at the same `/registry/{group}/iprange` key the plugin uses.

use anyhow::{bail, Context, Result};
use serde::Serialize;

use trunknet_cni::ipam;
use trunknet_cni::store::Kv;

use crate::cli::{PoolCommands, PoolSetArgs, PoolShowArgs};

use super::open_store;

/// JSON output structure for pool show
#[derive(Debug, Serialize)]
struct PoolOutput {
    group: String,
    key: String,
    revision: i64,
    remaining: usize,
    entries: Vec<String>,
}

/// Run a pool command
pub fn run(cmd: PoolCommands) -> Result<()> {
    match cmd {
        PoolCommands::Show(args) => show(args),
        PoolCommands::Set(args) => set(args),
    }
}

/// Show the remaining pool of one group
fn show(args: PoolShowArgs) -> Result<()> {
    let store = open_store()?;
    let key = ipam::pool_key(&args.group);

    let Some(entry) = store.get(&key)? else {
        bail!("no pool exists for group {}", args.group);
    };
    let pool = ipam::parse_pool(&entry.value)
        .with_context(|| format!("stored pool for group {} is unreadable", args.group))?;

    let entries: Vec<String> = pool.iter().map(|cidr| cidr.to_string()).collect();

    if args.json {
        let output = PoolOutput {
            group: args.group,
            key,
            revision: entry.revision,
            remaining: entries.len(),
            entries,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Group:     {}", args.group);
    println!("Key:       {}", key);
    println!("Revision:  {}", entry.revision);
    println!("Remaining: {}", entries.len());
    for cidr in &entries {
        println!("  {}", cidr);
    }

    Ok(())
}

/// Replace the pool of one group
///
/// The whole value is rewritten, so this is the seeding tool, not an
/// append. Entries are parsed before anything touches the store.
fn set(args: PoolSetArgs) -> Result<()> {
    let pool = ipam::parse_pool(&args.cidrs.join(","))
        .context("pool entries must be IPv4 addresses in CIDR notation")?;

    let store = open_store()?;
    let key = ipam::pool_key(&args.group);
    store.put(&key, &ipam::serialize_pool(&pool))?;

    println!("wrote {} entries to {}", pool.len(), key);

    Ok(())
}
