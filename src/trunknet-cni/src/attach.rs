//! Attach/detach orchestration
//!
//! ADD runs `allocate -> resolve -> bridge -> sub-interface -> veth ->
//! announce`, persists an attachment record, and rolls the allocation
//! and veth back if any later step fails, so a failed attach never
//! leaks a consumed address. DEL reverses from the persisted record and
//! is safe to repeat against torn-down or half-built state; shared
//! links are only removed once no other recorded attachment uses their
//! VLAN. GET reads the record without touching the host.

use std::time::{SystemTime, UNIX_EPOCH};

use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

use crate::bridge;
use crate::error::{CniError, CniErrorCode};
use crate::ipam::{self, Allocation};
use crate::result::AttachmentRecord;
use crate::store::Kv;
use crate::veth;
use crate::vlan::VlanPolicy;
use crate::vlanif;

/// Store prefix holding one record per attached container
pub const ATTACHMENT_KEY_PREFIX: &str = "/registry/attachments/";

/// Store key of a container's attachment record
pub fn attachment_key(container_id: &str) -> String {
    format!("{}{}", ATTACHMENT_KEY_PREFIX, container_id)
}

/// Everything one ADD needs to place a container
#[derive(Debug, Clone)]
pub struct AttachRequest<'a> {
    pub container_id: &'a str,
    pub netns_path: &'a str,
    pub container_ifname: &'a str,
    pub parent_interface: &'a str,
    pub group: &'a str,
    pub candidates: &'a [String],
}

/// Attach a container and persist the resulting record
///
/// A container that already holds a record keeps its allocation: the
/// per-pod plumbing is rebuilt against the current namespace path and
/// no second address is drawn from the pool.
pub fn attach(
    store: &dyn Kv,
    policy: &dyn VlanPolicy,
    req: &AttachRequest<'_>,
) -> Result<AttachmentRecord, CniError> {
    if let Some(entry) = store.get(&attachment_key(req.container_id))? {
        let record = parse_record(req.container_id, &entry.value)?;
        info!(
            container = req.container_id,
            ip = %record.ip,
            "attachment already recorded, rebuilding plumbing"
        );

        let allocation = Allocation {
            ip: parse_addr(req.container_id, &record.ip)?,
            gateway: parse_addr(req.container_id, &record.gateway)?,
        };

        // stale per-pod links from the earlier attempt, rebuilt below
        veth::delete_veth(&record.host_if_name)?;

        // the recorded allocation stays owned by this container even if
        // the rebuild fails, so there is nothing to roll back here
        return wire(store, policy, req, &allocation);
    }

    let allocation = ipam::allocate(store, req.group, req.candidates)?;

    match wire(store, policy, req, &allocation) {
        Ok(record) => Ok(record),
        Err(err) => {
            rollback(store, req.container_id, req.group, &allocation);
            Err(err)
        }
    }
}

/// Tear down a container's attachment
///
/// Reverses ADD from the persisted record: veth first, then the address
/// back to the pool, then the shared links if this was the VLAN's last
/// pod, and the record itself last so a failure at any point leaves a
/// retryable state. Without a record only the derived veth name can be
/// cleaned, and that is done.
pub fn detach(store: &dyn Kv, container_id: &str) -> Result<(), CniError> {
    let key = attachment_key(container_id);

    let Some(entry) = store.get(&key)? else {
        veth::delete_veth(&veth::generate_host_ifname(container_id))?;
        debug!(container = container_id, "no attachment recorded");
        return Ok(());
    };
    let record = parse_record(container_id, &entry.value)?;

    veth::delete_veth(&record.host_if_name)?;

    let ip = parse_addr(container_id, &record.ip)?;
    ipam::release(store, &record.group, ip)?;

    if vlan_in_use_by_others(store, container_id, record.vlan_id)? {
        debug!(vlan = record.vlan_id, "vlan still in use, keeping shared links");
    } else {
        vlanif::delete_vlan_subif(&record.vlan_if_name)?;
        bridge::delete_bridge(&record.bridge_name)?;
    }

    store.delete(&key)?;
    info!(container = container_id, ip = %record.ip, "detached container");
    Ok(())
}

/// Report a container's recorded attachment
pub fn query(store: &dyn Kv, container_id: &str) -> Result<AttachmentRecord, CniError> {
    let entry = store.get(&attachment_key(container_id))?.ok_or_else(|| {
        CniError::new(
            CniErrorCode::UnknownContainer,
            &format!("container {} is not attached", container_id),
        )
    })?;
    parse_record(container_id, &entry.value)
}

fn wire(
    store: &dyn Kv,
    policy: &dyn VlanPolicy,
    req: &AttachRequest<'_>,
    allocation: &Allocation,
) -> Result<AttachmentRecord, CniError> {
    let vlan = policy.resolve(allocation.ip);
    if vlan.is_unmapped() {
        warn!(ip = %allocation.ip, "no vlan mapping for address, using sentinel id 0");
    }

    let bridge = bridge::ensure_bridge(&bridge::bridge_name(vlan))?;

    let subif_name = vlanif::vlan_ifname(req.parent_interface, vlan);
    let subif = vlanif::ensure_vlan_subif(req.parent_interface, &subif_name, &bridge, vlan)?;

    let pair = veth::create_veth(
        req.container_id,
        req.netns_path,
        req.container_ifname,
        allocation.ip,
        allocation.gateway,
    )?;
    veth::attach_veth(
        &pair.host_ifname,
        &bridge,
        req.netns_path,
        req.container_ifname,
        allocation.ip,
    )?;

    let record = AttachmentRecord {
        container_if_name: pair.container_ifname,
        host_if_name: pair.host_ifname,
        container_mac: pair.container_mac,
        bridge_name: bridge.name,
        vlan_if_name: subif.name,
        vlan_id: subif.vlan_id.value(),
        group: req.group.to_string(),
        ip: allocation.ip.to_string(),
        gateway: allocation.gateway.to_string(),
        netns_path: req.netns_path.to_string(),
        created_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    };

    let value = serde_json::to_string(&record).map_err(|e| {
        CniError::io_error("failed to serialize attachment record").with_details(&e.to_string())
    })?;
    store.put(&attachment_key(req.container_id), &value)?;

    info!(
        container = req.container_id,
        ip = %allocation.ip,
        vlan = %vlan,
        "attached container"
    );
    Ok(record)
}

/// Undo a failed fresh attach: drop the half-built veth, return the
/// address. Failures here are logged, not returned, so the original
/// error reaches the caller.
fn rollback(store: &dyn Kv, container_id: &str, group: &str, allocation: &Allocation) {
    let host_ifname = veth::generate_host_ifname(container_id);
    if let Err(e) = veth::delete_veth(&host_ifname) {
        warn!(error = %e, host = %host_ifname, "rollback could not delete veth");
    }
    if let Err(e) = ipam::release(store, group, allocation.ip) {
        warn!(error = %e, group, ip = %allocation.ip, "rollback could not return address to pool");
    }
}

fn vlan_in_use_by_others(
    store: &dyn Kv,
    container_id: &str,
    vlan_id: u16,
) -> Result<bool, CniError> {
    let own_key = attachment_key(container_id);

    for (key, value) in store.get_prefix(ATTACHMENT_KEY_PREFIX)? {
        if key == own_key {
            continue;
        }
        match serde_json::from_str::<AttachmentRecord>(&value) {
            Ok(record) if record.vlan_id == vlan_id => return Ok(true),
            Ok(_) => {}
            Err(e) => warn!(key = %key, error = %e, "skipping unreadable attachment record"),
        }
    }

    Ok(false)
}

fn parse_record(container_id: &str, value: &str) -> Result<AttachmentRecord, CniError> {
    serde_json::from_str(value).map_err(|e| {
        CniError::decode_error(&format!("malformed attachment record for {}", container_id))
            .with_details(&e.to_string())
    })
}

fn parse_addr(container_id: &str, addr: &str) -> Result<Ipv4Network, CniError> {
    addr.parse().map_err(|e: ipnetwork::IpNetworkError| {
        CniError::address_parse(&format!(
            "attachment record for {} has malformed address {}",
            container_id, addr
        ))
        .with_details(&e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;
    use crate::store::MemoryStore;
    use crate::vlan::TableVlanPolicy;
    use std::collections::HashMap;

    fn seed_record(store: &MemoryStore, container_id: &str, vlan_id: u16, ip: &str, group: &str) {
        let record = AttachmentRecord {
            container_if_name: "eth0".to_string(),
            host_if_name: veth::generate_host_ifname(container_id),
            container_mac: "02:ab:c1:23:de:f4".to_string(),
            bridge_name: format!("br{}", vlan_id),
            vlan_if_name: format!("tnt-p9.{}", vlan_id),
            vlan_id,
            group: group.to_string(),
            ip: ip.to_string(),
            gateway: "10.0.4.4/24".to_string(),
            netns_path: "/run/netns/gone".to_string(),
            created_at: 0,
        };
        store
            .put(&attachment_key(container_id), &serde_json::to_string(&record).unwrap())
            .unwrap();
    }

    #[test]
    fn test_attachment_key_layout() {
        assert_eq!(attachment_key("abc123"), "/registry/attachments/abc123");
    }

    #[test]
    fn test_query_not_attached() {
        let store = MemoryStore::new();
        let err = query(&store, "ghost").unwrap_err();
        assert_eq!(err.code(), CniErrorCode::UnknownContainer);
    }

    #[test]
    fn test_query_corrupt_record() {
        let store = MemoryStore::new();
        store.put(&attachment_key("bad"), "not json").unwrap();
        let err = query(&store, "bad").unwrap_err();
        assert_eq!(err.code(), CniErrorCode::DecodingFailure);
    }

    #[test]
    fn test_detach_without_record_is_noop() {
        let store = MemoryStore::new();
        detach(&store, "neverseen").unwrap();
    }

    #[test]
    fn test_attach_missing_pool_leaves_no_state() {
        let store = MemoryStore::new();
        let table: HashMap<String, u16> = HashMap::new();
        let policy = TableVlanPolicy::from_table(&table).unwrap();
        let req = AttachRequest {
            container_id: "cafe01",
            netns_path: "/run/netns/gone",
            container_ifname: "eth0",
            parent_interface: "bond1",
            group: "g1",
            candidates: &[],
        };

        let err = attach(&store, &policy, &req).unwrap_err();
        assert_eq!(err.code(), CniErrorCode::PoolUnavailable);
        assert!(store.get_prefix(ATTACHMENT_KEY_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn test_detach_releases_address_and_clears_record() {
        // interface names in the record do not exist, so every link
        // delete is a lookup miss and the store logic runs on its own
        let store = MemoryStore::new();
        store.put("/registry/g1/iprange", "").unwrap();
        seed_record(&store, "cafe01", 301, "10.0.4.5/23", "g1");

        detach(&store, "cafe01").unwrap();

        assert!(store.get(&attachment_key("cafe01")).unwrap().is_none());
        let pool = store.get("/registry/g1/iprange").unwrap().unwrap().value;
        assert_eq!(pool, "10.0.4.5/23");

        let err = query(&store, "cafe01").unwrap_err();
        assert_eq!(err.code(), CniErrorCode::UnknownContainer);

        // repeating the teardown converges instead of failing
        detach(&store, "cafe01").unwrap();
        let pool = store.get("/registry/g1/iprange").unwrap().unwrap().value;
        assert_eq!(pool, "10.0.4.5/23");
    }

    #[test]
    fn test_vlan_refcount_sees_other_attachments() {
        let store = MemoryStore::new();
        seed_record(&store, "cafe01", 301, "10.0.4.5/23", "g1");
        assert!(!vlan_in_use_by_others(&store, "cafe01", 301).unwrap());

        seed_record(&store, "cafe02", 301, "10.0.4.6/23", "g1");
        assert!(vlan_in_use_by_others(&store, "cafe01", 301).unwrap());

        seed_record(&store, "cafe03", 302, "10.0.6.5/23", "g1");
        assert!(!vlan_in_use_by_others(&store, "cafe03", 302).unwrap());
    }

    #[test]
    fn test_refcount_skips_unreadable_records() {
        let store = MemoryStore::new();
        store.put(&attachment_key("junk"), "not json").unwrap();
        assert!(!vlan_in_use_by_others(&store, "cafe01", 301).unwrap());
    }

    #[test]
    #[ignore = "requires CAP_NET_ADMIN and `ip netns add trunknet-test`"]
    fn test_attach_detach_lifecycle() {
        let store = MemoryStore::new();
        store.put("/registry/g1/iprange", "10.0.4.5/23,10.0.4.6/23").unwrap();

        let mut table = HashMap::new();
        table.insert("10.0.4.5/23".to_string(), 301u16);
        let policy = TableVlanPolicy::from_table(&table).unwrap();

        link::with_handle(|handle| async move {
            match handle.link().add().dummy("tnt-p1".to_string()).execute().await {
                Ok(()) => Ok(()),
                Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => Ok(()),
                Err(e) => Err(CniError::link_create("tnt-p1").with_details(&e.to_string())),
            }
        })
        .unwrap();

        let req = AttachRequest {
            container_id: "0123456789abcdef",
            netns_path: "/run/netns/trunknet-test",
            container_ifname: "eth0",
            parent_interface: "tnt-p1",
            group: "g1",
            candidates: &[],
        };

        let record = attach(&store, &policy, &req).unwrap();
        assert_eq!(record.ip, "10.0.4.5/23");
        assert_eq!(record.gateway, "10.0.4.4/24");
        assert_eq!(record.bridge_name, "br301");
        assert_eq!(record.vlan_if_name, "tnt-p1.301");
        assert!(link::link_exists(&record.host_if_name).unwrap());

        let fetched = query(&store, "0123456789abcdef").unwrap();
        assert_eq!(fetched.ip, record.ip);

        detach(&store, "0123456789abcdef").unwrap();
        assert!(query(&store, "0123456789abcdef").is_err());
        assert!(!link::link_exists(&record.host_if_name).unwrap());
        assert!(!link::link_exists("br301").unwrap());
        let pool = store.get("/registry/g1/iprange").unwrap().unwrap().value;
        assert!(pool.contains("10.0.4.5/23"));

        link::with_handle(|handle| async move {
            link::delete_link_by_name(&handle, "tnt-p1").await
        })
        .unwrap();
    }
}
