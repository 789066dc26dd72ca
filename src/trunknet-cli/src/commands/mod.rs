//! Command implementations
//!
//! This module contains the implementation of all CLI commands.

use anyhow::{Context, Result};

use trunknet_cni::config::PluginConfig;
use trunknet_cni::store::EtcdStore;

pub mod attachments;
pub mod pool;

/// Open the store the plugin writes to, using the plugin's own
/// configuration file so both sides agree on endpoints and TLS
fn open_store() -> Result<EtcdStore> {
    let config = PluginConfig::load().context("failed to load plugin configuration")?;
    EtcdStore::open(&config.store).context("failed to connect to the store")
}
