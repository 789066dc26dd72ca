//! Plugin configuration
//!
//! Two configuration surfaces feed the plugin: the CNI network
//! configuration JSON arriving on stdin, and the host-local TOML file
//! carrying everything the orchestrator does not know about (store
//! endpoints, uplink interface, VLAN table, log sink). `CNI_ARGS` parsing
//! lives here too.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CniError, CniErrorCode};

/// Default path of the plugin configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/trunknet/config.toml";

/// Environment variable overriding the configuration file path
pub const CONFIG_PATH_ENV: &str = "TRUNKNET_CONFIG";

/// CNI_ARGS key carrying the pod name
pub const ARG_POD_NAME: &str = "K8S_POD_NAME";

/// CNI_ARGS key carrying the pod namespace
pub const ARG_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";

/// Network configuration passed to the CNI plugin on stdin
///
/// See: https://github.com/containernetworking/cni/blob/spec-v0.4.0/SPEC.md#network-configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// CNI specification version
    pub cni_version: String,

    /// Network name (must be unique on the host)
    pub name: String,

    /// CNI plugin type (matches binary name)
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Parent (bonded) uplink carrying the tagged VLAN traffic;
    /// overrides the plugin config when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_interface: Option<String>,

    /// Previous result from chain (for DEL/GET)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<serde_json::Value>,

    /// DNS configuration, echoed into the result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,

    /// Additional arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

impl NetworkConfig {
    /// Parse the stdin document
    pub fn parse(input: &str) -> Result<Self, CniError> {
        serde_json::from_str(input).map_err(|e| {
            CniError::decode_error("failed to parse network config").with_details(&e.to_string())
        })
    }

    /// Resolve the uplink name, preferring the stdin document over the
    /// host configuration file
    pub fn parent_interface<'a>(&'a self, plugin: &'a PluginConfig) -> &'a str {
        self.parent_interface
            .as_deref()
            .unwrap_or(&plugin.parent_interface)
    }
}

/// DNS configuration from the network config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
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

impl From<DnsConfig> for crate::result::DnsResult {
    fn from(dns: DnsConfig) -> Self {
        Self {
            nameservers: dns.nameservers,
            domain: dns.domain,
            search: dns.search,
            options: dns.options,
        }
    }
}

/// Host-local plugin configuration (TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// KV store connection settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Log sink settings
    #[serde(default)]
    pub log: LogConfig,

    /// Parent (bonded) uplink for VLAN sub-interfaces
    #[serde(default = "default_parent_interface")]
    pub parent_interface: String,

    /// Kubeconfig used to read pod annotations
    #[serde(default = "default_kubeconfig")]
    pub kubeconfig: PathBuf,

    /// Address-to-VLAN table, keyed by the exact allocated CIDR
    #[serde(default = "default_vlans")]
    pub vlans: HashMap<String, u16>,
}

fn default_parent_interface() -> String {
    "bond1".to_string()
}

fn default_kubeconfig() -> PathBuf {
    PathBuf::from("/etc/kubernetes/kubelet.conf")
}

fn default_vlans() -> HashMap<String, u16> {
    let mut vlans = HashMap::new();
    vlans.insert("192.168.1.1/23".to_string(), 2135);
    vlans
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            log: LogConfig::default(),
            parent_interface: default_parent_interface(),
            kubeconfig: default_kubeconfig(),
            vlans: default_vlans(),
        }
    }
}

/// KV store connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// etcd endpoints
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Client certificate for mutual TLS
    pub cert_file: Option<PathBuf>,

    /// Client key for mutual TLS
    pub key_file: Option<PathBuf>,

    /// CA certificate for mutual TLS
    pub ca_file: Option<PathBuf>,

    /// Session lease TTL in seconds
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: i64,
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_lease_ttl() -> i64 {
    60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            cert_file: None,
            key_file: None,
            ca_file: None,
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

impl StoreConfig {
    /// Whether mutual TLS material is configured
    ///
    /// All three paths must be present together; a partial set is a
    /// configuration error caught by `PluginConfig::validate`.
    pub fn tls_enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some() && self.ca_file.is_some()
    }
}

/// Log sink settings
///
/// Stdout belongs to the CNI result document, so logs go to a file.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log file path
    #[serde(default = "default_log_file")]
    pub file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/trunknet/cni.log")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

impl PluginConfig {
    /// Load the plugin configuration
    ///
    /// Reads `TRUNKNET_CONFIG` if set, `/etc/trunknet/config.toml`
    /// otherwise; a missing file yields the defaults.
    pub fn load() -> Result<Self, CniError> {
        let path = env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    /// Load the plugin configuration from an explicit path
    pub fn load_from(path: &std::path::Path) -> Result<Self, CniError> {
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(path).map_err(|e| {
            CniError::io_error(&format!("failed to read config file {}", path.display()))
                .with_details(&e.to_string())
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            CniError::config_error(&format!("failed to parse config file {}", path.display()))
                .with_details(&e.to_string())
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the rest of the plugin cannot act on
    pub fn validate(&self) -> Result<(), CniError> {
        if self.store.endpoints.is_empty() {
            return Err(CniError::config_error("store.endpoints must not be empty"));
        }

        let tls_parts = [
            self.store.cert_file.is_some(),
            self.store.key_file.is_some(),
            self.store.ca_file.is_some(),
        ];
        if tls_parts.iter().any(|p| *p) && !tls_parts.iter().all(|p| *p) {
            return Err(CniError::config_error(
                "store TLS requires cert_file, key_file, and ca_file together",
            ));
        }

        if self.store.lease_ttl_secs <= 0 {
            return Err(CniError::config_error("store.lease_ttl_secs must be positive"));
        }

        for (cidr, vlan) in &self.vlans {
            if !(1..=4094).contains(vlan) {
                return Err(CniError::config_error(&format!(
                    "vlan id {} for {} outside 1-4094",
                    vlan, cidr
                )));
            }
        }

        Ok(())
    }
}

/// Parse the `CNI_ARGS` value: semicolon-separated `KEY=VALUE` pairs
///
/// An empty string yields an empty map; a pair without exactly one `=`
/// is an error.
pub fn parse_cni_args(raw: &str) -> Result<HashMap<String, String>, CniError> {
    let mut args = HashMap::new();
    if raw.trim().is_empty() {
        return Ok(args);
    }

    for pair in raw.split(';') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next();
        match value {
            Some(value) if !key.is_empty() => {
                args.insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(CniError::new(
                    CniErrorCode::InvalidEnvironmentVariables,
                    &format!("malformed CNI_ARGS pair: {}", pair),
                ));
            }
        }
    }

    Ok(args)
}
