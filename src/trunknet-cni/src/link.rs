//! Netlink link primitives
//!
//! Shared plumbing for the bridge, VLAN sub-interface, and veth
//! managers: runtime setup, connection handling, and the small link
//! operations all of them need. Each public entry point owns its own
//! runtime and netlink socket for the duration of one call, matching
//! the one-shot process model.

use std::future::Future;

use futures::TryStreamExt;
use rtnetlink::{new_connection, Handle};
use tokio::runtime::Runtime;

use crate::error::CniError;

/// MTU applied to every link this plugin creates
pub const LINK_MTU: u32 = 1500;

fn connect() -> Result<Handle, CniError> {
    let (connection, handle, _) = new_connection().map_err(|e| {
        CniError::io_error("failed to create netlink connection").with_details(&e.to_string())
    })?;

    tokio::spawn(connection);

    Ok(handle)
}

/// Run a netlink closure on a fresh multi-threaded runtime
pub(crate) fn with_handle<T, F, Fut>(f: F) -> Result<T, CniError>
where
    F: FnOnce(Handle) -> Fut,
    Fut: Future<Output = Result<T, CniError>>,
{
    let rt = Runtime::new().map_err(|e| {
        CniError::io_error("failed to create tokio runtime").with_details(&e.to_string())
    })?;

    rt.block_on(async move {
        let handle = connect()?;
        f(handle).await
    })
}

/// Run a netlink closure on a runtime confined to the calling thread
///
/// Namespace-scoped callers use this so the netlink socket and every
/// task polling it stay on the thread that entered the namespace.
pub(crate) fn with_pinned_handle<T, F, Fut>(f: F) -> Result<T, CniError>
where
    F: FnOnce(Handle) -> Fut,
    Fut: Future<Output = Result<T, CniError>>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(|e| {
            CniError::io_error("failed to create tokio runtime").with_details(&e.to_string())
        })?;

    rt.block_on(async move {
        let handle = connect()?;
        f(handle).await
    })
}

/// Look up a link's index by name, `None` if it does not exist
pub(crate) async fn link_index(handle: &Handle, name: &str) -> Result<Option<u32>, CniError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();

    match links.try_next().await {
        Ok(Some(link)) => Ok(Some(link.header.index)),
        Ok(None) => Ok(None),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
        Err(e) => Err(
            CniError::io_error(&format!("failed to look up link {}", name))
                .with_details(&e.to_string()),
        ),
    }
}

/// Bring a link up
pub(crate) async fn set_link_up(handle: &Handle, index: u32, name: &str) -> Result<(), CniError> {
    handle.link().set(index).up().execute().await.map_err(|e| {
        CniError::link_up(&format!("failed to bring {} up", name)).with_details(&e.to_string())
    })
}

/// Set a link's MTU
pub(crate) async fn set_link_mtu(
    handle: &Handle,
    index: u32,
    mtu: u32,
    name: &str,
) -> Result<(), CniError> {
    handle.link().set(index).mtu(mtu).execute().await.map_err(|e| {
        CniError::io_error(&format!("failed to set mtu {} on {}", mtu, name))
            .with_details(&e.to_string())
    })
}

/// Delete a link by name, tolerating one that is already gone
///
/// Returns whether a link was actually deleted.
pub(crate) async fn delete_link_by_name(handle: &Handle, name: &str) -> Result<bool, CniError> {
    let Some(index) = link_index(handle, name).await? else {
        return Ok(false);
    };

    match handle.link().del(index).execute().await {
        Ok(()) => Ok(true),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(false),
        Err(e) => Err(
            CniError::io_error(&format!("failed to delete link {}", name))
                .with_details(&e.to_string()),
        ),
    }
}

/// Report whether a named link exists in the current namespace
pub fn link_exists(name: &str) -> Result<bool, CniError> {
    let name = name.to_string();
    with_handle(|handle| async move { Ok(link_index(&handle, &name).await?.is_some()) })
}
