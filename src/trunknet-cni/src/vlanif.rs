//! 802.1Q sub-interface management
//!
//! Each VLAN gets one tagged sub-interface on the bonded uplink, named
//! `{parent}.{id}` and enslaved to that VLAN's bridge. Like the bridge
//! it is shared by every pod on the segment and created lazily by the
//! first pod to land there. The parent is looked up before anything is
//! touched, so a missing uplink fails cleanly with no host mutation.

use tracing::{debug, info};

use crate::bridge::BridgeHandle;
use crate::error::{CniError, CniErrorCode};
use crate::link::{self, LINK_MTU};
use crate::vlan::VlanId;

/// Name of the tagged sub-interface for a VLAN on a parent link
pub fn vlan_ifname(parent: &str, vlan: VlanId) -> String {
    format!("{}.{}", parent, vlan)
}

/// Descriptor of an existing VLAN sub-interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanLinkHandle {
    pub name: String,
    pub index: u32,
    pub vlan_id: VlanId,
}

/// Create the tagged sub-interface if missing and return its descriptor
///
/// A sub-interface that already exists is returned as-is. Only one this
/// call creates is enslaved to the bridge, given the plugin MTU, and
/// brought up.
pub fn ensure_vlan_subif(
    parent: &str,
    name: &str,
    bridge: &BridgeHandle,
    vlan: VlanId,
) -> Result<VlanLinkHandle, CniError> {
    let parent = parent.to_string();
    let name = name.to_string();
    let bridge = bridge.clone();

    link::with_handle(|handle| async move {
        let parent_index = link::link_index(&handle, &parent).await?.ok_or_else(|| {
            CniError::new(
                CniErrorCode::ParentInterfaceMissing,
                &format!("parent interface {} does not exist", parent),
            )
        })?;

        match handle
            .link()
            .add()
            .vlan(name.clone(), parent_index, vlan.value())
            .execute()
            .await
        {
            Ok(()) => {
                let index = link::link_index(&handle, &name).await?.ok_or_else(|| {
                    CniError::link_create(&format!(
                        "vlan sub-interface {} (vlan {}) created but not found",
                        name, vlan
                    ))
                })?;

                handle
                    .link()
                    .set(index)
                    .controller(bridge.index)
                    .execute()
                    .await
                    .map_err(|e| {
                        CniError::link_create(&format!(
                            "failed to enslave {} (vlan {}) to bridge {}",
                            name, vlan, bridge.name
                        ))
                        .with_details(&e.to_string())
                    })?;

                link::set_link_mtu(&handle, index, LINK_MTU, &name).await?;
                link::set_link_up(&handle, index, &name).await?;

                info!(subif = %name, vlan = %vlan, parent = %parent, "created vlan sub-interface");
                Ok(VlanLinkHandle { name, index, vlan_id: vlan })
            }
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                let index = link::link_index(&handle, &name).await?.ok_or_else(|| {
                    CniError::link_create(&format!(
                        "vlan sub-interface {} (vlan {}) exists but has no index",
                        name, vlan
                    ))
                })?;
                debug!(subif = %name, vlan = %vlan, "vlan sub-interface already exists");
                Ok(VlanLinkHandle { name, index, vlan_id: vlan })
            }
            Err(e) => Err(CniError::link_create(&format!(
                "failed to create vlan sub-interface {} (vlan {})",
                name, vlan
            ))
            .with_details(&e.to_string())),
        }
    })
}

/// Delete the sub-interface, tolerating one that is already gone
pub fn delete_vlan_subif(name: &str) -> Result<bool, CniError> {
    let name = name.to_string();
    link::with_handle(|handle| async move {
        let deleted = link::delete_link_by_name(&handle, &name).await?;
        if deleted {
            info!(subif = %name, "deleted vlan sub-interface");
        }
        Ok(deleted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{delete_bridge, ensure_bridge};

    #[test]
    fn test_subif_naming() {
        let vlan = VlanId::new(2135).unwrap();
        assert_eq!(vlan_ifname("bond1", vlan), "bond1.2135");
        assert_eq!(vlan_ifname("bond0", VlanId::new(7).unwrap()), "bond0.7");
    }

    #[test]
    fn test_missing_parent_fails_without_mutation() {
        let bridge = BridgeHandle { name: "br301".to_string(), index: 1 };
        let vlan = VlanId::new(301).unwrap();
        let name = vlan_ifname("tnt-np0", vlan);

        let err = ensure_vlan_subif("tnt-np0", &name, &bridge, vlan).unwrap_err();
        assert_eq!(err.code(), CniErrorCode::ParentInterfaceMissing);
        assert!(!link::link_exists(&name).unwrap());
    }

    #[test]
    #[ignore = "requires CAP_NET_ADMIN"]
    fn test_ensure_subif_idempotent() {
        let parent = "tnt-p0";
        let vlan = VlanId::new(301).unwrap();
        let name = vlan_ifname(parent, vlan);

        link::with_handle(|handle| async move {
            handle
                .link()
                .add()
                .dummy(parent.to_string())
                .execute()
                .await
                .map_err(|e| CniError::link_create("dummy").with_details(&e.to_string()))
        })
        .unwrap();

        let bridge = ensure_bridge("br301").unwrap();
        let first = ensure_vlan_subif(parent, &name, &bridge, vlan).unwrap();
        let second = ensure_vlan_subif(parent, &name, &bridge, vlan).unwrap();
        assert_eq!(first, second);

        assert!(delete_vlan_subif(&name).unwrap());
        assert!(delete_bridge("br301").unwrap());
        link::with_handle(|handle| async move {
            link::delete_link_by_name(&handle, parent).await
        })
        .unwrap();
    }
}
