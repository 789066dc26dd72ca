//! Veth pair management
//!
//! The pair is created inside the container namespace so the container
//! end can be named `eth0` without colliding with host interfaces; the
//! host end is then moved out through the saved namespace descriptor.
//! Address and default route are installed while still inside the
//! scope. Attachment enslaves the host end to the VLAN bridge and
//! announces the new binding with a gratuitous ARP from inside the
//! container.

use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::Handle;
use tracing::{debug, info, warn};

use crate::arp;
use crate::bridge::BridgeHandle;
use crate::error::CniError;
use crate::link::{self, LINK_MTU};
use crate::netns;

/// Linux limit is 15 plus the null terminator
const MAX_IFNAME_LEN: usize = 15;

/// Prefix for host-side veth names
const HOST_VETH_PREFIX: &str = "tn-";

/// Both ends of a created pair, as seen after creation
#[derive(Debug, Clone)]
pub struct VethPair {
    /// Host-side interface name
    pub host_ifname: String,
    /// Container-side interface name
    pub container_ifname: String,
    /// MAC address of the container end
    pub container_mac: String,
}

/// Host-side veth name derived from the container id
pub fn generate_host_ifname(container_id: &str) -> String {
    let id_part: String = container_id
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(MAX_IFNAME_LEN - HOST_VETH_PREFIX.len())
        .collect();

    format!("{}{}", HOST_VETH_PREFIX, id_part)
}

/// Create and configure the pair for one container
///
/// Runs scoped inside the namespace at `netns_path`: creates the pair,
/// moves the host end back to the host namespace, then installs the
/// address and the default route on the container end. A container end
/// that already exists is reconfigured rather than recreated, so a
/// repeated ADD for the same container converges instead of failing.
pub fn create_veth(
    container_id: &str,
    netns_path: &str,
    container_ifname: &str,
    ip: Ipv4Network,
    gateway: Ipv4Network,
) -> Result<VethPair, CniError> {
    let host_ifname = generate_host_ifname(container_id);
    let container_ifname = container_ifname.to_string();

    netns::with_netns(netns_path, |guard| {
        let host_fd = guard.host_fd();
        let host_ifname = host_ifname.clone();
        let container_ifname = container_ifname.clone();

        link::with_pinned_handle(|handle| async move {
            let (index, mac) = match get_link(&handle, &container_ifname).await? {
                Some(existing) => {
                    debug!(ifname = %container_ifname, "container end already present, reusing");
                    let mac = link_mac(&existing).ok_or_else(|| {
                        CniError::link_create(&format!("no mac reported for {}", container_ifname))
                    })?;
                    (existing.header.index, mac)
                }
                None => {
                    match handle
                        .link()
                        .add()
                        .veth(container_ifname.clone(), host_ifname.clone())
                        .execute()
                        .await
                    {
                        Ok(()) => {}
                        Err(rtnetlink::Error::NetlinkError(e))
                            if e.raw_code() == -libc::EEXIST =>
                        {
                            debug!(ifname = %container_ifname, "veth pair created concurrently");
                        }
                        Err(e) => {
                            return Err(CniError::link_create(&format!(
                                "failed to create veth pair {} / {}",
                                container_ifname, host_ifname
                            ))
                            .with_details(&e.to_string()));
                        }
                    }

                    let container = get_link(&handle, &container_ifname).await?.ok_or_else(|| {
                        CniError::link_create(&format!(
                            "veth created but container end {} not found",
                            container_ifname
                        ))
                    })?;
                    let mac = link_mac(&container).ok_or_else(|| {
                        CniError::link_create(&format!("no mac reported for {}", container_ifname))
                    })?;
                    let index = container.header.index;

                    let host_index =
                        link::link_index(&handle, &host_ifname).await?.ok_or_else(|| {
                            CniError::link_create(&format!(
                                "veth created but host end {} not found",
                                host_ifname
                            ))
                        })?;

                    link::set_link_mtu(&handle, index, LINK_MTU, &container_ifname).await?;
                    link::set_link_mtu(&handle, host_index, LINK_MTU, &host_ifname).await?;

                    handle
                        .link()
                        .set(host_index)
                        .setns_by_fd(host_fd)
                        .execute()
                        .await
                        .map_err(|e| {
                            CniError::link_create(&format!(
                                "failed to move {} to the host namespace",
                                host_ifname
                            ))
                            .with_details(&e.to_string())
                        })?;

                    (index, mac)
                }
            };

            // loopback is the pod's own business, failure is not fatal
            if let Some(lo_index) = link::link_index(&handle, "lo").await? {
                if let Err(e) = handle.link().set(lo_index).up().execute().await {
                    warn!(error = %e, "failed to bring loopback up");
                }
            }

            match handle
                .address()
                .add(index, IpAddr::V4(ip.ip()), ip.prefix())
                .execute()
                .await
            {
                Ok(()) => {}
                Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                    debug!(ifname = %container_ifname, addr = %ip, "address already present");
                }
                Err(e) => {
                    return Err(CniError::io_error(&format!(
                        "failed to add address {} to {}",
                        ip, container_ifname
                    ))
                    .with_details(&e.to_string()));
                }
            }

            link::set_link_up(&handle, index, &container_ifname).await?;

            match handle
                .route()
                .add()
                .v4()
                .destination_prefix(Ipv4Addr::new(0, 0, 0, 0), 0)
                .gateway(gateway.ip())
                .execute()
                .await
            {
                Ok(()) => {}
                Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                    debug!("default route already present");
                }
                Err(e) => {
                    return Err(CniError::route_error(&format!(
                        "failed to add default route via {}",
                        gateway.ip()
                    ))
                    .with_details(&e.to_string()));
                }
            }

            info!(
                ifname = %container_ifname,
                host = %host_ifname,
                addr = %ip,
                gateway = %gateway.ip(),
                "configured container end"
            );

            Ok(VethPair { host_ifname, container_ifname, container_mac: mac })
        })
    })
}

/// Enslave the host end to the bridge and announce the binding
///
/// The gratuitous ARP runs scoped inside the container namespace, out
/// the container end, so upstream switches learn the MAC-to-IP binding
/// before the pod's first organic packet.
pub fn attach_veth(
    host_ifname: &str,
    bridge: &BridgeHandle,
    netns_path: &str,
    container_ifname: &str,
    addr: Ipv4Network,
) -> Result<(), CniError> {
    let host = host_ifname.to_string();
    let bridge = bridge.clone();

    link::with_handle(|handle| async move {
        let index = link::link_index(&handle, &host).await?.ok_or_else(|| {
            CniError::attach_error(&format!("host end {} not found", host))
        })?;

        handle
            .link()
            .set(index)
            .controller(bridge.index)
            .execute()
            .await
            .map_err(|e| {
                CniError::attach_error(&format!(
                    "failed to enslave {} to bridge {}",
                    host, bridge.name
                ))
                .with_details(&e.to_string())
            })?;

        link::set_link_up(&handle, index, &host).await?;
        info!(host = %host, bridge = %bridge.name, "attached veth to bridge");
        Ok(())
    })?;

    netns::with_netns(netns_path, |_| arp::announce(container_ifname, addr.ip()))
}

/// Delete the pair by its host end, tolerating one already gone
///
/// Removing either end removes both, so this works whether or not the
/// container namespace still exists.
pub fn delete_veth(host_ifname: &str) -> Result<bool, CniError> {
    let host = host_ifname.to_string();
    link::with_handle(|handle| async move {
        let deleted = link::delete_link_by_name(&handle, &host).await?;
        if deleted {
            info!(host = %host, "deleted veth pair");
        } else {
            debug!(host = %host, "veth already deleted or never created");
        }
        Ok(deleted)
    })
}

async fn get_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>, CniError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();

    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
        Err(e) => Err(
            CniError::io_error(&format!("failed to look up link {}", name))
                .with_details(&e.to_string()),
        ),
    }
}

fn link_mac(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) => Some(format_mac(bytes)),
        _ => None,
    })
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_host_ifname() {
        let name = generate_host_ifname("abc123def456");
        assert_eq!(name, "tn-abc123def456");
        assert!(name.len() <= MAX_IFNAME_LEN);

        // long container ids are truncated to fit
        let name = generate_host_ifname("0123456789abcdef0123456789abcdef");
        assert_eq!(name, "tn-0123456789ab");
        assert!(name.len() <= MAX_IFNAME_LEN);

        // non-hex characters are dropped before truncation
        let name = generate_host_ifname("container-xyz-123");
        assert_eq!(name, "tn-cae123");
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(&[0x02, 0xab, 0xc1, 0x23, 0xde, 0xf4]), "02:ab:c1:23:de:f4");
        assert_eq!(format_mac(&[0, 0, 0, 0, 0, 0]), "00:00:00:00:00:00");
    }

    #[test]
    fn test_delete_missing_veth_is_noop() {
        assert!(!delete_veth("tn-000missing00").unwrap());
    }
}
