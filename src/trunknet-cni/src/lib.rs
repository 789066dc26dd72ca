//! VLAN-segmented container networking
//!
//! Attaches container network namespaces to a VLAN-segmented
//! data-center fabric: an address is drawn from a distributed pool in
//! etcd, mapped to a VLAN, and wired through a per-VLAN bridge and an
//! 802.1Q sub-interface on the bonded uplink, with a veth pair carrying
//! the container's traffic onto the bridge.
//!
//! Modules follow the lifecycle: [`store`] and [`ipam`] handle
//! allocation, [`vlan`] the address-to-VLAN mapping, [`bridge`],
//! [`vlanif`], [`veth`], [`netns`] and [`arp`] the host plumbing, and
//! [`attach`] ties them into the ADD/DEL/GET contract the runtime
//! invokes through the `trunknet` binary.

pub mod arp;
pub mod attach;
pub mod bridge;
pub mod config;
pub mod error;
pub mod ipam;
pub mod link;
pub mod netns;
pub mod podmeta;
pub mod result;
pub mod store;
pub mod veth;
pub mod vlan;
pub mod vlanif;
