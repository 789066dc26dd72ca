//! VLAN resolution
//!
//! Maps an allocated address to the VLAN id of the segment it belongs
//! to. The mapping is a policy seam: the shipped implementation is a
//! fixed table from the host configuration, keyed by the exact CIDR
//! string handed out by the pool.

use std::collections::HashMap;
use std::fmt;

use ipnetwork::Ipv4Network;

use crate::error::CniError;

/// 802.1Q VLAN identifier
///
/// Valid ids are 1..=4094. `UNMAPPED` (0) is the sentinel for addresses
/// no policy entry covers; it cannot collide with a real VLAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VlanId(u16);

impl VlanId {
    /// Sentinel for addresses outside every mapped segment
    pub const UNMAPPED: VlanId = VlanId(0);

    /// Construct a validated id
    pub fn new(id: u16) -> Option<VlanId> {
        if (1..=4094).contains(&id) {
            Some(VlanId(id))
        } else {
            None
        }
    }

    pub fn value(self) -> u16 {
        self.0
    }

    pub fn is_unmapped(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strategy mapping an allocated address to its VLAN
pub trait VlanPolicy {
    /// Resolve an address to a VLAN id, `VlanId::UNMAPPED` when no
    /// entry covers it
    fn resolve(&self, ip: Ipv4Network) -> VlanId;
}

/// Fixed-table policy sourced from the host configuration
///
/// Entries match the allocated CIDR exactly, mask included; there is no
/// containment logic. A pool handing out `10.0.4.5/23` needs a table
/// entry written as `10.0.4.5/23`.
#[derive(Debug, Clone)]
pub struct TableVlanPolicy {
    table: HashMap<Ipv4Network, VlanId>,
}

impl TableVlanPolicy {
    /// Build the policy from the configured `{cidr = id}` table
    pub fn from_table(raw: &HashMap<String, u16>) -> Result<TableVlanPolicy, CniError> {
        let mut table = HashMap::with_capacity(raw.len());
        for (cidr, id) in raw {
            let network: Ipv4Network = cidr.parse().map_err(|e: ipnetwork::IpNetworkError| {
                CniError::config_error(&format!("malformed vlan table key {}", cidr))
                    .with_details(&e.to_string())
            })?;
            let vlan = VlanId::new(*id).ok_or_else(|| {
                CniError::config_error(&format!("vlan id {} for {} outside 1-4094", id, cidr))
            })?;
            table.insert(network, vlan);
        }
        Ok(TableVlanPolicy { table })
    }
}

impl VlanPolicy for TableVlanPolicy {
    fn resolve(&self, ip: Ipv4Network) -> VlanId {
        self.table.get(&ip).copied().unwrap_or(VlanId::UNMAPPED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(entries: &[(&str, u16)]) -> TableVlanPolicy {
        let raw: HashMap<String, u16> =
            entries.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        TableVlanPolicy::from_table(&raw).unwrap()
    }

    #[test]
    fn test_vlan_id_bounds() {
        assert!(VlanId::new(0).is_none());
        assert_eq!(VlanId::new(1).unwrap().value(), 1);
        assert_eq!(VlanId::new(4094).unwrap().value(), 4094);
        assert!(VlanId::new(4095).is_none());
    }

    #[test]
    fn test_unmapped_sentinel() {
        assert!(VlanId::UNMAPPED.is_unmapped());
        assert!(!VlanId::new(2135).unwrap().is_unmapped());
        assert_eq!(VlanId::UNMAPPED.to_string(), "0");
    }

    #[test]
    fn test_resolve_mapped_address() {
        let policy = policy(&[("192.168.1.1/23", 2135)]);
        let ip: Ipv4Network = "192.168.1.1/23".parse().unwrap();
        assert_eq!(policy.resolve(ip).value(), 2135);
    }

    #[test]
    fn test_resolve_unknown_address() {
        let policy = policy(&[("192.168.1.1/23", 2135)]);
        let ip: Ipv4Network = "10.0.4.5/23".parse().unwrap();
        assert_eq!(policy.resolve(ip), VlanId::UNMAPPED);
    }

    #[test]
    fn test_resolve_matches_mask_exactly() {
        let policy = policy(&[("192.168.1.1/23", 2135)]);
        let ip: Ipv4Network = "192.168.1.1/24".parse().unwrap();
        assert_eq!(policy.resolve(ip), VlanId::UNMAPPED);
    }

    #[test]
    fn test_from_table_rejects_bad_key() {
        let mut raw = HashMap::new();
        raw.insert("not-a-cidr".to_string(), 100u16);
        assert!(TableVlanPolicy::from_table(&raw).is_err());
    }

    #[test]
    fn test_from_table_rejects_bad_id() {
        let mut raw = HashMap::new();
        raw.insert("10.0.4.0/23".to_string(), 0u16);
        assert!(TableVlanPolicy::from_table(&raw).is_err());
    }
}
