//! IP pool allocation
//!
//! Pools are ordered CIDR lists stored comma-joined under
//! `/registry/{group}/iprange`. Allocation pops the head entry and writes
//! the remainder back with a compare-and-swap against the revision the
//! pool was read at, so two invocations racing on the same group can
//! never pop the same address. Release is the inverse append, under the
//! same discipline.
//!
//! The comma-joined string is a wire format only; everything in-process
//! works on typed `Ipv4Network` values parsed at this boundary.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tracing::{debug, warn};

use crate::error::{CniError, CniErrorCode};
use crate::store::Kv;

/// Pool entry separator on the wire
const POOL_SEPARATOR: char = ',';

/// Attempts against a contended pool before giving up
const CAS_MAX_RETRIES: usize = 10;

/// One allocation: the popped address and its derived gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Address assigned to the container, mask preserved from the pool
    pub ip: Ipv4Network,
    /// Gateway for the default route, always /24
    pub gateway: Ipv4Network,
}

/// Store key holding a group's candidate pool
pub fn pool_key(group: &str) -> String {
    format!("/registry/{}/iprange", group)
}

/// Parse the comma-joined pool value into typed entries
///
/// An empty or whitespace-only value is an empty pool, not an error.
pub fn parse_pool(raw: &str) -> Result<Vec<Ipv4Network>, CniError> {
    let mut pool = Vec::new();
    for part in raw.split(POOL_SEPARATOR) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let cidr: Ipv4Network = part.parse().map_err(|e: ipnetwork::IpNetworkError| {
            CniError::address_parse(&format!("malformed pool entry {}", part))
                .with_details(&e.to_string())
        })?;
        pool.push(cidr);
    }
    Ok(pool)
}

/// Serialize pool entries back to the wire format
pub fn serialize_pool(pool: &[Ipv4Network]) -> String {
    pool.iter()
        .map(|cidr| cidr.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Derive the gateway for an allocated address
///
/// Addresses are handed out in even/odd pairs sharing one gateway: the
/// even final octet. An odd final octet points one down, an even one
/// keeps its value. The gateway mask is always /24 regardless of the
/// pool entry's mask.
pub fn derive_gateway(ip: Ipv4Network) -> Result<Ipv4Network, CniError> {
    let octets = ip.ip().octets();
    let gateway = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3] - octets[3] % 2);
    Ipv4Network::new(gateway, 24).map_err(|e| {
        CniError::address_parse(&format!("failed to derive gateway for {}", ip))
            .with_details(&e.to_string())
    })
}

/// Pop one address from the group's pool
///
/// `candidate_hints` is the pod's declared address list. Selection is
/// strict FIFO and the hints do not narrow the pool; they are logged so
/// operators can correlate the declared intent with what was handed out.
pub fn allocate(
    store: &dyn Kv,
    group: &str,
    candidate_hints: &[String],
) -> Result<Allocation, CniError> {
    let key = pool_key(group);
    if !candidate_hints.is_empty() {
        debug!(group, hints = ?candidate_hints, "pod declared candidate addresses");
    }

    for attempt in 0..CAS_MAX_RETRIES {
        let entry = store.get(&key)?.ok_or_else(|| {
            CniError::pool_unavailable(&format!("no address pool for group {}", group))
                .with_details(&key)
        })?;

        let pool = parse_pool(&entry.value)?;
        let Some((head, rest)) = pool.split_first() else {
            return Err(CniError::new(
                CniErrorCode::NoAddressAvailable,
                &format!("address pool for group {} is empty", group),
            ));
        };

        let gateway = derive_gateway(*head)?;

        if store.compare_and_swap(&key, entry.revision, &serialize_pool(rest))? {
            debug!(group, ip = %head, gateway = %gateway, "allocated address");
            return Ok(Allocation { ip: *head, gateway });
        }

        warn!(group, attempt, "pool changed under allocation, retrying");
    }

    Err(CniError::new(
        CniErrorCode::ConcurrentAllocationConflict,
        &format!(
            "pool for group {} still contended after {} attempts",
            group, CAS_MAX_RETRIES
        ),
    ))
}

/// Return an address to the group's pool
///
/// Appends rather than overwrites so entries released concurrently by
/// other invocations survive, and deduplicates so a retried teardown
/// cannot double-insert. An absent pool key is recreated with just this
/// entry.
pub fn release(store: &dyn Kv, group: &str, ip: Ipv4Network) -> Result<(), CniError> {
    let key = pool_key(group);

    for attempt in 0..CAS_MAX_RETRIES {
        match store.get(&key)? {
            Some(entry) => {
                let mut pool = parse_pool(&entry.value)?;
                if pool.contains(&ip) {
                    debug!(group, ip = %ip, "address already in pool");
                    return Ok(());
                }
                pool.push(ip);
                if store.compare_and_swap(&key, entry.revision, &serialize_pool(&pool))? {
                    debug!(group, ip = %ip, "returned address to pool");
                    return Ok(());
                }
            }
            None => {
                if store.compare_and_swap(&key, 0, &ip.to_string())? {
                    debug!(group, ip = %ip, "recreated pool with returned address");
                    return Ok(());
                }
            }
        }

        warn!(group, attempt, "pool changed under release, retrying");
    }

    Err(CniError::new(
        CniErrorCode::ConcurrentAllocationConflict,
        &format!(
            "pool for group {} still contended after {} attempts",
            group, CAS_MAX_RETRIES
        ),
    ))
}
