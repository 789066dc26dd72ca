//! KV store access
//!
//! All cross-invocation state (allocation pools, attachment records) lives
//! in etcd. The `Kv` trait is the seam the allocator and orchestrator are
//! written against; `EtcdStore` is the production implementation and
//! `MemoryStore` provides the same revision semantics in-process for tests
//! and dry runs.
//!
//! The client is an explicit handle opened at process start and passed to
//! whoever needs it; nothing in this crate holds a global store.

use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;
use std::time::Duration;

use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, GetOptions, Identity, LeaseKeeper,
    LeaseKeepAliveStream, TlsOptions, Txn, TxnOp,
};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::CniError;

/// A value read from the store together with its modification revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// The stored value
    pub value: String,
    /// Revision of the last write to this key
    pub revision: i64,
}

/// Minimal KV interface the plugin needs
///
/// `compare_and_swap` with `expected_revision` 0 means "create only if the
/// key does not exist"; it returns `Ok(false)` when the revision no longer
/// matches so callers can re-read and retry.
pub trait Kv: Send + Sync {
    /// Read one key
    fn get(&self, key: &str) -> Result<Option<KvEntry>, CniError>;

    /// Write one key unconditionally
    fn put(&self, key: &str, value: &str) -> Result<(), CniError>;

    /// Write one key only if its revision still matches
    fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: i64,
        value: &str,
    ) -> Result<bool, CniError>;

    /// Delete one key; deleting an absent key is not an error
    fn delete(&self, key: &str) -> Result<(), CniError>;

    /// Read all keys under a prefix, sorted by key
    fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CniError>;
}

/// etcd-backed store
///
/// Owns its tokio runtime so callers stay synchronous, which matches the
/// short-lived one-invocation process model. A session lease is granted at
/// open and kept alive in the background for client liveness; pool and
/// attachment writes are plain puts, never lease-scoped, so an expired
/// session cannot erase state.
pub struct EtcdStore {
    rt: Runtime,
    client: Client,
    lease_id: i64,
}

impl EtcdStore {
    /// Connect to etcd and grant the session lease
    pub fn open(config: &StoreConfig) -> Result<Self, CniError> {
        let rt = Runtime::new().map_err(|e| {
            CniError::io_error("failed to create tokio runtime").with_details(&e.to_string())
        })?;

        let endpoints = config.endpoints.clone();
        let ttl = config.lease_ttl_secs;
        let tls = tls_options(config)?;

        let (client, lease_id, keeper, stream) = rt.block_on(async move {
            let mut options = ConnectOptions::new()
                .with_connect_timeout(Duration::from_secs(5))
                .with_timeout(Duration::from_secs(10));
            if let Some(tls) = tls {
                options = options.with_tls(tls);
            }

            let mut client = Client::connect(endpoints, Some(options))
                .await
                .map_err(|e| {
                    CniError::pool_unavailable("failed to connect to etcd")
                        .with_details(&e.to_string())
                })?;

            let lease = client.lease_grant(ttl, None).await.map_err(|e| {
                CniError::pool_unavailable("failed to grant session lease")
                    .with_details(&e.to_string())
            })?;
            let lease_id = lease.id();

            let (keeper, stream) = client.lease_keep_alive(lease_id).await.map_err(|e| {
                CniError::pool_unavailable("failed to start lease keep-alive")
                    .with_details(&e.to_string())
            })?;

            Ok::<_, CniError>((client, lease_id, keeper, stream))
        })?;

        debug!(lease_id, "etcd session established");

        let period = Duration::from_secs((ttl.max(3) as u64) / 3);
        rt.spawn(keep_lease_alive(keeper, stream, period));

        Ok(Self {
            rt,
            client,
            lease_id,
        })
    }

    /// The session lease id
    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }
}

/// Refresh the session lease until the keep-alive channel breaks
///
/// The lease guards nothing durable, so a broken keep-alive only gets a
/// warning; the next invocation grants a fresh lease.
async fn keep_lease_alive(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if let Err(e) = keeper.keep_alive().await {
            warn!(error = %e, "lease keep-alive send failed");
            return;
        }
        match stream.message().await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("lease keep-alive stream closed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "lease keep-alive receive failed");
                return;
            }
        }
    }
}

/// Build the TLS options from configured certificate paths
fn tls_options(config: &StoreConfig) -> Result<Option<TlsOptions>, CniError> {
    if !config.tls_enabled() {
        return Ok(None);
    }

    // validate() guarantees all three are present together
    let (Some(cert_file), Some(key_file), Some(ca_file)) =
        (&config.cert_file, &config.key_file, &config.ca_file)
    else {
        return Ok(None);
    };

    let cert = fs::read(cert_file).map_err(|e| {
        CniError::config_error(&format!("failed to read cert_file {}", cert_file.display()))
            .with_details(&e.to_string())
    })?;
    let key = fs::read(key_file).map_err(|e| {
        CniError::config_error(&format!("failed to read key_file {}", key_file.display()))
            .with_details(&e.to_string())
    })?;
    let ca = fs::read(ca_file).map_err(|e| {
        CniError::config_error(&format!("failed to read ca_file {}", ca_file.display()))
            .with_details(&e.to_string())
    })?;

    Ok(Some(
        TlsOptions::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key)),
    ))
}

fn store_error(op: &str, key: &str, e: etcd_client::Error) -> CniError {
    CniError::pool_unavailable(&format!("etcd {} failed for {}", op, key))
        .with_details(&e.to_string())
}

impl Kv for EtcdStore {
    fn get(&self, key: &str) -> Result<Option<KvEntry>, CniError> {
        let mut client = self.client.clone();
        let key = key.to_string();
        self.rt.block_on(async move {
            let resp = client
                .get(key.as_str(), None)
                .await
                .map_err(|e| store_error("get", &key, e))?;

            match resp.kvs().first() {
                Some(kv) => {
                    let value = kv
                        .value_str()
                        .map_err(|e| {
                            CniError::decode_error(&format!("non-utf8 value at {}", key))
                                .with_details(&e.to_string())
                        })?
                        .to_string();
                    Ok(Some(KvEntry {
                        value,
                        revision: kv.mod_revision(),
                    }))
                }
                None => Ok(None),
            }
        })
    }

    fn put(&self, key: &str, value: &str) -> Result<(), CniError> {
        let mut client = self.client.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.rt.block_on(async move {
            client
                .put(key.as_str(), value, None)
                .await
                .map(|_| ())
                .map_err(|e| store_error("put", &key, e))
        })
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: i64,
        value: &str,
    ) -> Result<bool, CniError> {
        let mut client = self.client.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.rt.block_on(async move {
            // mod_revision of an absent key compares as 0, which gives the
            // create-if-absent case for free
            let txn = Txn::new()
                .when(vec![Compare::mod_revision(
                    key.as_str(),
                    CompareOp::Equal,
                    expected_revision,
                )])
                .and_then(vec![TxnOp::put(key.as_str(), value, None)]);

            let resp = client
                .txn(txn)
                .await
                .map_err(|e| store_error("txn", &key, e))?;
            Ok(resp.succeeded())
        })
    }

    fn delete(&self, key: &str) -> Result<(), CniError> {
        let mut client = self.client.clone();
        let key = key.to_string();
        self.rt.block_on(async move {
            client
                .delete(key.as_str(), None)
                .await
                .map(|_| ())
                .map_err(|e| store_error("delete", &key, e))
        })
    }

    fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CniError> {
        let mut client = self.client.clone();
        let prefix = prefix.to_string();
        self.rt.block_on(async move {
            let resp = client
                .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
                .await
                .map_err(|e| store_error("get", &prefix, e))?;

            let mut entries = Vec::with_capacity(resp.kvs().len());
            for kv in resp.kvs() {
                let key = kv.key_str().map_err(|e| {
                    CniError::decode_error("non-utf8 key in prefix scan")
                        .with_details(&e.to_string())
                })?;
                let value = kv.value_str().map_err(|e| {
                    CniError::decode_error(&format!("non-utf8 value at {}", key))
                        .with_details(&e.to_string())
                })?;
                entries.push((key.to_string(), value.to_string()));
            }
            entries.sort();
            Ok(entries)
        })
    }
}

/// In-process store with etcd-like revision semantics
///
/// Revisions are a single monotonic counter shared by all keys, matching
/// how etcd's mod revisions behave for the compare-and-swap paths the
/// plugin uses.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, (String, i64)>,
    revision: i64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Kv for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<KvEntry>, CniError> {
        let inner = self.lock();
        Ok(inner.entries.get(key).map(|(value, revision)| KvEntry {
            value: value.clone(),
            revision: *revision,
        }))
    }

    fn put(&self, key: &str, value: &str) -> Result<(), CniError> {
        let mut inner = self.lock();
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .entries
            .insert(key.to_string(), (value.to_string(), revision));
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: i64,
        value: &str,
    ) -> Result<bool, CniError> {
        let mut inner = self.lock();
        let current = inner.entries.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if current != expected_revision {
            return Ok(false);
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .entries
            .insert(key.to_string(), (value.to_string(), revision));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), CniError> {
        let mut inner = self.lock();
        inner.entries.remove(key);
        Ok(())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CniError> {
        let inner = self.lock();
        let mut entries: Vec<(String, String)> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_get_put() {
        let store = MemoryStore::new();
        assert!(store.get("/registry/g1/iprange").unwrap().is_none());

        store.put("/registry/g1/iprange", "10.0.4.5/23").unwrap();
        let entry = store.get("/registry/g1/iprange").unwrap().unwrap();
        assert_eq!(entry.value, "10.0.4.5/23");
        assert!(entry.revision > 0);
    }

    #[test]
    fn test_memory_revisions_advance() {
        let store = MemoryStore::new();
        store.put("k", "a").unwrap();
        let first = store.get("k").unwrap().unwrap().revision;
        store.put("k", "b").unwrap();
        let second = store.get("k").unwrap().unwrap().revision;
        assert!(second > first);
    }

    #[test]
    fn test_memory_cas_matches_revision() {
        let store = MemoryStore::new();
        store.put("k", "a").unwrap();
        let entry = store.get("k").unwrap().unwrap();

        assert!(store.compare_and_swap("k", entry.revision, "b").unwrap());
        assert_eq!(store.get("k").unwrap().unwrap().value, "b");

        // stale revision loses
        assert!(!store.compare_and_swap("k", entry.revision, "c").unwrap());
        assert_eq!(store.get("k").unwrap().unwrap().value, "b");
    }

    #[test]
    fn test_memory_cas_create_if_absent() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("k", 0, "a").unwrap());
        assert_eq!(store.get("k").unwrap().unwrap().value, "a");

        // key exists now, so revision 0 no longer matches
        assert!(!store.compare_and_swap("k", 0, "b").unwrap());
    }

    #[test]
    fn test_memory_delete_then_recreate() {
        let store = MemoryStore::new();
        store.put("k", "a").unwrap();
        let old = store.get("k").unwrap().unwrap().revision;
        store.delete("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
        // deleting again is fine
        store.delete("k").unwrap();

        assert!(store.compare_and_swap("k", 0, "b").unwrap());
        assert!(store.get("k").unwrap().unwrap().revision > old);
    }

    #[test]
    fn test_memory_get_prefix_sorted() {
        let store = MemoryStore::new();
        store.put("/registry/attachments/ctr-b", "2").unwrap();
        store.put("/registry/attachments/ctr-a", "1").unwrap();
        store.put("/registry/g1/iprange", "x").unwrap();

        let entries = store.get_prefix("/registry/attachments/").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "/registry/attachments/ctr-a");
        assert_eq!(entries[1].0, "/registry/attachments/ctr-b");
    }
}
