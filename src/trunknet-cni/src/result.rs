//! CNI Result types
//!
//! Output formats for CNI operations as defined in CNI Spec 0.4.0, plus the
//! attachment record persisted per container so DEL and GET survive process
//! restarts.

use serde::{Deserialize, Serialize};

/// Result returned by ADD and GET operations
///
/// See: https://github.com/containernetworking/cni/blob/spec-v0.4.0/SPEC.md#result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    /// CNI specification version
    pub cni_version: String,

    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,

    /// IP addresses assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IpConfig>>,

    /// Routes configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteConfig>>,

    /// DNS configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsResult>,
}

impl CniResult {
    /// Create a new CNI result
    pub fn new(cni_version: String) -> Self {
        Self {
            cni_version,
            interfaces: None,
            ips: None,
            routes: None,
            dns: None,
        }
    }

    /// Add an interface to the result
    pub fn with_interface(mut self, name: String, mac: String, sandbox: Option<String>) -> Self {
        let iface = Interface { name, mac, sandbox };
        match &mut self.interfaces {
            Some(interfaces) => interfaces.push(iface),
            None => self.interfaces = Some(vec![iface]),
        }
        self
    }

    /// Add an IPv4 configuration to the result
    pub fn with_ip(mut self, address: String, gateway: Option<String>, interface: usize) -> Self {
        let ip = IpConfig {
            version: Some("4".to_string()),
            address,
            gateway,
            interface: Some(interface),
        };
        match &mut self.ips {
            Some(ips) => ips.push(ip),
            None => self.ips = Some(vec![ip]),
        }
        self
    }

    /// Add a route to the result
    ///
    /// # Arguments
    /// * `dst` - Destination network in CIDR notation (e.g., "0.0.0.0/0")
    /// * `gw` - Optional gateway IP address
    pub fn with_route(mut self, dst: String, gw: Option<String>) -> Self {
        let route = RouteConfig { dst, gw };
        match &mut self.routes {
            Some(routes) => routes.push(route),
            None => self.routes = Some(vec![route]),
        }
        self
    }

    /// Set DNS configuration
    pub fn with_dns(mut self, dns: DnsResult) -> Self {
        self.dns = Some(dns);
        self
    }
}

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,

    /// MAC address
    pub mac: String,

    /// Network namespace path (for container-side interfaces)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP address configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    /// Address family ("4"; the plugin allocates IPv4 only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// IP address in CIDR notation
    pub address: String,

    /// Gateway IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Index into interfaces array
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Destination network in CIDR notation
    pub dst: String,

    /// Gateway IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// DNS configuration result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsResult {
    /// DNS nameserver IPs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,

    /// DNS domain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// DNS search domains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,

    /// DNS options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Result returned by VERSION operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    /// Current CNI version
    pub cni_version: String,

    /// List of supported CNI versions
    pub supported_versions: Vec<String>,
}

/// Attachment state persisted under `/registry/attachments/{containerId}`
///
/// Written after a successful ADD and read back by DEL (to find the veth,
/// the pool group, and the shared objects) and by GET (to report state
/// without touching the host).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRecord {
    /// Interface name inside the container (usually "eth0")
    pub container_if_name: String,

    /// Host-side veth end name
    pub host_if_name: String,

    /// MAC address of the container-side interface
    pub container_mac: String,

    /// Bridge the host end is enslaved to
    pub bridge_name: String,

    /// 802.1Q sub-interface feeding the bridge
    pub vlan_if_name: String,

    /// VLAN id the attachment landed on (0 = unmapped sentinel)
    pub vlan_id: u16,

    /// Allocation group the address was popped from
    pub group: String,

    /// Allocated address in CIDR notation
    pub ip: String,

    /// Derived gateway in CIDR notation
    pub gateway: String,

    /// Container namespace path at attach time
    pub netns_path: String,

    /// Unix timestamp of the attach
    pub created_at: u64,
}

impl AttachmentRecord {
    /// Render the record as the CNI result document
    ///
    /// The result gateway is the bare address; the record keeps the full
    /// CIDR so DEL can reason about the subnet.
    pub fn to_result(&self, cni_version: &str) -> CniResult {
        let gateway_addr = self
            .gateway
            .split('/')
            .next()
            .unwrap_or(&self.gateway)
            .to_string();

        CniResult::new(cni_version.to_string())
            .with_interface(
                self.container_if_name.clone(),
                self.container_mac.clone(),
                Some(self.netns_path.clone()),
            )
            .with_ip(self.ip.clone(), Some(gateway_addr.clone()), 0)
            .with_route("0.0.0.0/0".to_string(), Some(gateway_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cni_result_builder() {
        let result = CniResult::new("0.4.0".to_string())
            .with_interface(
                "eth0".to_string(),
                "02:42:ac:11:00:02".to_string(),
                Some("/var/run/netns/ctr".to_string()),
            )
            .with_ip("10.0.4.5/23".to_string(), Some("10.0.4.4".to_string()), 0)
            .with_route("0.0.0.0/0".to_string(), Some("10.0.4.4".to_string()));

        assert_eq!(result.cni_version, "0.4.0");
        assert_eq!(result.interfaces.as_ref().unwrap().len(), 1);
        assert_eq!(result.ips.as_ref().unwrap().len(), 1);
        assert_eq!(result.routes.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_result_serialization() {
        let result = CniResult::new("0.4.0".to_string())
            .with_ip("10.0.4.5/23".to_string(), Some("10.0.4.4".to_string()), 0);

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"cniVersion\":\"0.4.0\""));
        assert!(json.contains("\"version\":\"4\""));
        assert!(json.contains("\"address\":\"10.0.4.5/23\""));
        assert!(json.contains("\"gateway\":\"10.0.4.4\""));
        // Nothing was added to these, so they must not appear at all
        assert!(!json.contains("\"interfaces\""));
        assert!(!json.contains("\"dns\""));
    }

    #[test]
    fn test_version_result() {
        let result = VersionResult {
            cni_version: "0.4.0".to_string(),
            supported_versions: vec!["0.3.1".to_string(), "0.4.0".to_string()],
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"cniVersion\":\"0.4.0\""));
        assert!(json.contains("\"supportedVersions\""));
    }

    #[test]
    fn test_attachment_record_roundtrip() {
        let record = AttachmentRecord {
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
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"hostIfName\":\"tn-0123456789ab\""));
        assert!(json.contains("\"vlanId\":2135"));

        let parsed: AttachmentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.bridge_name, record.bridge_name);
        assert_eq!(parsed.group, "g1");
    }

    #[test]
    fn test_record_to_result_strips_gateway_mask() {
        let record = AttachmentRecord {
            container_if_name: "eth0".to_string(),
            host_if_name: "tn-ab".to_string(),
            container_mac: "aa:bb:cc:dd:ee:ff".to_string(),
            bridge_name: "br7".to_string(),
            vlan_if_name: "bond1.7".to_string(),
            vlan_id: 7,
            group: "g1".to_string(),
            ip: "10.0.4.6/23".to_string(),
            gateway: "10.0.4.6/24".to_string(),
            netns_path: "/proc/42/ns/net".to_string(),
            created_at: 0,
        };

        let result = record.to_result("0.4.0");
        let ips = result.ips.unwrap();
        assert_eq!(ips[0].address, "10.0.4.6/23");
        assert_eq!(ips[0].gateway.as_deref(), Some("10.0.4.6"));
        let routes = result.routes.unwrap();
        assert_eq!(routes[0].dst, "0.0.0.0/0");
    }
}
