//! Attachment commands
//!
//! Lists and inspects the per-container records the plugin persists
//! under `/registry/attachments/`.

use anyhow::{bail, Result};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use trunknet_cni::attach::ATTACHMENT_KEY_PREFIX;
use trunknet_cni::result::AttachmentRecord;
use trunknet_cni::store::Kv;

use crate::cli::{AttachmentCommands, AttachmentListArgs, AttachmentShowArgs};

use super::open_store;

/// Attachment display information
#[derive(Debug, Clone, Serialize, Tabled)]
struct AttachmentDisplay {
    #[tabled(rename = "CONTAINER ID")]
    id: String,

    #[tabled(rename = "ADDRESS")]
    address: String,

    #[tabled(rename = "VLAN")]
    vlan: u16,

    #[tabled(rename = "BRIDGE")]
    bridge: String,

    #[tabled(rename = "GROUP")]
    group: String,

    #[tabled(rename = "HOST IF")]
    host_if: String,
}

/// JSON output structure for attachments list
#[derive(Debug, Serialize)]
struct ListOutput {
    attachments: Vec<AttachmentDisplay>,
    total: usize,
}

/// Run an attachments command
pub fn run(cmd: AttachmentCommands) -> Result<()> {
    match cmd {
        AttachmentCommands::List(args) => list(args),
        AttachmentCommands::Show(args) => show(args),
    }
}

/// Read every record under the attachments prefix
///
/// Records that fail to parse are reported and skipped rather than
/// aborting the listing.
fn fetch_records(store: &dyn Kv) -> Result<Vec<(String, AttachmentRecord)>> {
    let mut records = Vec::new();
    for (key, value) in store.get_prefix(ATTACHMENT_KEY_PREFIX)? {
        let id = key.trim_start_matches(ATTACHMENT_KEY_PREFIX).to_string();
        match serde_json::from_str::<AttachmentRecord>(&value) {
            Ok(record) => records.push((id, record)),
            Err(e) => eprintln!("warning: skipping unreadable record at {}: {}", key, e),
        }
    }
    Ok(records)
}

/// List every recorded attachment
fn list(args: AttachmentListArgs) -> Result<()> {
    let store = open_store()?;
    let records = fetch_records(&store)?;

    let rows: Vec<AttachmentDisplay> = records
        .iter()
        .map(|(id, record)| AttachmentDisplay {
            id: short_id(id),
            address: record.ip.clone(),
            vlan: record.vlan_id,
            bridge: record.bridge_name.clone(),
            group: record.group.clone(),
            host_if: record.host_if_name.clone(),
        })
        .collect();

    if args.json {
        let output = ListOutput {
            total: rows.len(),
            attachments: rows,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No attachments recorded.");
        return Ok(());
    }

    let table = Table::new(&rows).with(Style::blank()).to_string();
    println!("{}", table);
    println!();
    println!("Total: {} attachments", rows.len());

    Ok(())
}

/// Show the full record of one container
fn show(args: AttachmentShowArgs) -> Result<()> {
    let store = open_store()?;
    let records = fetch_records(&store)?;

    let mut matched: Vec<(String, AttachmentRecord)> = records
        .into_iter()
        .filter(|(id, _)| id.starts_with(&args.container))
        .collect();

    let (id, record) = match matched.len() {
        0 => bail!("no attachment recorded for {}", args.container),
        1 => matched.remove(0),
        n => bail!(
            "container id {} is ambiguous ({} matches)",
            args.container,
            n
        ),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("Container: {}", id);
    println!("Group:     {}", record.group);
    println!("Address:   {}", record.ip);
    println!("Gateway:   {}", record.gateway);
    println!("VLAN:      {}", record.vlan_id);
    println!("Bridge:    {}", record.bridge_name);
    println!("Sub-if:    {}", record.vlan_if_name);
    println!("Host veth: {}", record.host_if_name);
    println!(
        "Interface: {} ({})",
        record.container_if_name, record.container_mac
    );
    println!("Netns:     {}", record.netns_path);
    println!("Created:   {}", record.created_at);

    Ok(())
}

/// Shorten a container id for table display
fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trunknet_cni::store::MemoryStore;

    fn sample_record() -> AttachmentRecord {
        AttachmentRecord {
            container_if_name: "eth0".to_string(),
            host_if_name: "tn-0123456789ab".to_string(),
            container_mac: "aa:bb:cc:dd:ee:ff".to_string(),
            bridge_name: "br2135".to_string(),
            vlan_if_name: "bond1.2135".to_string(),
            vlan_id: 2135,
            group: "g1".to_string(),
            ip: "10.0.4.5/23".to_string(),
            gateway: "10.0.4.4/24".to_string(),
            netns_path: "/var/run/netns/pod".to_string(),
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
    }

    #[test]
    fn test_fetch_records_skips_garbage() {
        let store = MemoryStore::new();
        let json = serde_json::to_string(&sample_record()).unwrap();
        store.put("/registry/attachments/ctr-a", &json).unwrap();
        store.put("/registry/attachments/ctr-b", "not json").unwrap();

        let records = fetch_records(&store).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "ctr-a");
        assert_eq!(records[0].1.bridge_name, "br2135");
    }

    #[test]
    fn test_fetch_records_ignores_other_keys() {
        let store = MemoryStore::new();
        store.put("/registry/g1/iprange", "10.0.4.5/23").unwrap();

        let records = fetch_records(&store).unwrap();
        assert!(records.is_empty());
    }
}
