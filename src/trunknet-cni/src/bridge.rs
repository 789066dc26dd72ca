//! Bridge management
//!
//! One bridge per VLAN, named `br{id}`, shared by every pod on the
//! segment. Creation is a single netlink request that treats an
//! "already exists" answer as success, so concurrently starting pods on
//! the same VLAN cannot trip each other. A pre-existing bridge is
//! returned untouched.

use tracing::{debug, info};

use crate::error::CniError;
use crate::link::{self, LINK_MTU};
use crate::vlan::VlanId;

/// Name of the bridge carrying a VLAN's pods
pub fn bridge_name(vlan: VlanId) -> String {
    format!("br{}", vlan)
}

/// Descriptor of an existing bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeHandle {
    pub name: String,
    pub index: u32,
}

/// Create the bridge if missing and return its descriptor
///
/// A bridge that already exists is returned as-is, admin state and MTU
/// untouched. Only a bridge this call creates gets the plugin MTU and
/// is brought up.
pub fn ensure_bridge(name: &str) -> Result<BridgeHandle, CniError> {
    let name = name.to_string();
    link::with_handle(|handle| async move {
        match handle.link().add().bridge(name.clone()).execute().await {
            Ok(()) => {
                let index = link::link_index(&handle, &name).await?.ok_or_else(|| {
                    CniError::link_create(&format!("bridge {} created but not found", name))
                })?;
                link::set_link_mtu(&handle, index, LINK_MTU, &name).await?;
                link::set_link_up(&handle, index, &name).await?;
                info!(bridge = %name, index, "created bridge");
                Ok(BridgeHandle { name, index })
            }
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                let index = link::link_index(&handle, &name).await?.ok_or_else(|| {
                    CniError::link_create(&format!("bridge {} exists but has no index", name))
                })?;
                debug!(bridge = %name, index, "bridge already exists");
                Ok(BridgeHandle { name, index })
            }
            Err(e) => Err(
                CniError::link_create(&format!("failed to create bridge {}", name))
                    .with_details(&e.to_string()),
            ),
        }
    })
}

/// Delete the bridge, tolerating one that is already gone
pub fn delete_bridge(name: &str) -> Result<bool, CniError> {
    let name = name.to_string();
    link::with_handle(|handle| async move {
        let deleted = link::delete_link_by_name(&handle, &name).await?;
        if deleted {
            info!(bridge = %name, "deleted bridge");
        }
        Ok(deleted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_naming() {
        assert_eq!(bridge_name(VlanId::new(2135).unwrap()), "br2135");
        assert_eq!(bridge_name(VlanId::UNMAPPED), "br0");
    }

    #[test]
    #[ignore = "requires CAP_NET_ADMIN"]
    fn test_ensure_bridge_idempotent() {
        let name = "brtest4012";

        let first = ensure_bridge(name).unwrap();
        let second = ensure_bridge(name).unwrap();
        assert_eq!(first, second);

        assert!(delete_bridge(name).unwrap());
        assert!(!link::link_exists(name).unwrap());
    }
}
