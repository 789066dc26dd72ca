//! CNI Error types
//!
//! Error codes and types as defined in CNI Spec 0.4.0, plus the
//! plugin-specific codes for the attachment pipeline.

use thiserror::Error;

/// CNI error codes
///
/// Codes 1-11 are reserved by the CNI specification; 100+ are plugin
/// specific.
///
/// See: https://github.com/containernetworking/cni/blob/spec-v0.4.0/SPEC.md#error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CniErrorCode {
    /// 1: Incompatible CNI version
    IncompatibleVersion = 1,

    /// 2: Unsupported field in network configuration
    UnsupportedField = 2,

    /// 3: Container unknown or does not exist
    UnknownContainer = 3,

    /// 4: Invalid necessary environment variables
    InvalidEnvironmentVariables = 4,

    /// 5: I/O failure
    IoFailure = 5,

    /// 6: Failed to decode content
    DecodingFailure = 6,

    /// 7: Invalid network config
    InvalidNetworkConfig = 7,

    /// 11: Try again later
    TryAgainLater = 11,

    // Plugin-specific errors (100+)

    /// 100: KV store unreachable or pool key missing
    PoolUnavailable = 100,

    /// 101: Allocation pool is empty
    NoAddressAvailable = 101,

    /// 102: Malformed CIDR in pool, record, or annotation
    AddressParseError = 102,

    /// 103: Parent interface for the VLAN sub-interface does not exist
    ParentInterfaceMissing = 103,

    /// 104: Creating a bridge, VLAN sub-interface, or veth failed
    LinkCreateFailed = 104,

    /// 105: Bringing a link administratively up failed
    LinkUpFailed = 105,

    /// 106: Container network namespace could not be entered or restored
    NamespaceResolutionFailed = 106,

    /// 107: Installing the default route in the container failed
    RouteInstallFailed = 107,

    /// 108: Enslaving the host veth end to the bridge failed
    AttachFailed = 108,

    /// 109: Gratuitous ARP announcement failed
    ArpAnnounceFailed = 109,

    /// 110: Compare-and-swap retries exhausted against a contended pool
    ConcurrentAllocationConflict = 110,
}

/// CNI error with code, message, and optional details
#[derive(Debug, Error)]
#[error("{msg}")]
pub struct CniError {
    code: CniErrorCode,
    msg: String,
    details: Option<String>,
}

impl CniError {
    /// Create a new CNI error
    pub fn new(code: CniErrorCode, msg: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            details: None,
        }
    }

    /// Add details to the error
    pub fn with_details(mut self, details: &str) -> Self {
        self.details = Some(details.to_string());
        self
    }

    /// Get the error code
    pub fn code(&self) -> CniErrorCode {
        self.code
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Get the error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

// Convenience constructors for common errors

impl CniError {
    /// Create an IO error
    pub fn io_error(msg: &str) -> Self {
        Self::new(CniErrorCode::IoFailure, msg)
    }

    /// Create a decoding error
    pub fn decode_error(msg: &str) -> Self {
        Self::new(CniErrorCode::DecodingFailure, msg)
    }

    /// Create an invalid config error
    pub fn config_error(msg: &str) -> Self {
        Self::new(CniErrorCode::InvalidNetworkConfig, msg)
    }

    /// Create a pool-unavailable error
    pub fn pool_unavailable(msg: &str) -> Self {
        Self::new(CniErrorCode::PoolUnavailable, msg)
    }

    /// Create an address parse error
    pub fn address_parse(msg: &str) -> Self {
        Self::new(CniErrorCode::AddressParseError, msg)
    }

    /// Create a link creation error
    pub fn link_create(msg: &str) -> Self {
        Self::new(CniErrorCode::LinkCreateFailed, msg)
    }

    /// Create a link-up error
    pub fn link_up(msg: &str) -> Self {
        Self::new(CniErrorCode::LinkUpFailed, msg)
    }

    /// Create a namespace error
    pub fn namespace_error(msg: &str) -> Self {
        Self::new(CniErrorCode::NamespaceResolutionFailed, msg)
    }

    /// Create a route installation error
    pub fn route_error(msg: &str) -> Self {
        Self::new(CniErrorCode::RouteInstallFailed, msg)
    }

    /// Create a bridge-attach error
    pub fn attach_error(msg: &str) -> Self {
        Self::new(CniErrorCode::AttachFailed, msg)
    }

    /// Create a gratuitous-ARP error
    pub fn arp_error(msg: &str) -> Self {
        Self::new(CniErrorCode::ArpAnnounceFailed, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(CniErrorCode::IncompatibleVersion as u32, 1);
        assert_eq!(CniErrorCode::IoFailure as u32, 5);
        assert_eq!(CniErrorCode::PoolUnavailable as u32, 100);
        assert_eq!(CniErrorCode::ConcurrentAllocationConflict as u32, 110);
    }

    #[test]
    fn test_error_with_details() {
        let err = CniError::new(CniErrorCode::PoolUnavailable, "pool key missing")
            .with_details("/registry/g1/iprange");

        assert_eq!(err.code(), CniErrorCode::PoolUnavailable);
        assert_eq!(err.message(), "pool key missing");
        assert_eq!(err.details(), Some("/registry/g1/iprange"));
    }

    #[test]
    fn test_convenience_constructors() {
        let err = CniError::io_error("failed");
        assert_eq!(err.code(), CniErrorCode::IoFailure);

        let err = CniError::link_create("bridge br2135");
        assert_eq!(err.code(), CniErrorCode::LinkCreateFailed);

        let err = CniError::address_parse("not-a-cidr");
        assert_eq!(err.code(), CniErrorCode::AddressParseError);
    }
}
