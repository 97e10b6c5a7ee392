//! Shared-NIC underlay: the NIC stays on the host and the router reaches
//! it through the `ul-host`/`ul-pe` veth, with eBPF steering in between.

use crate::bpf::{Steering, SteeringLoader};
use crate::error::{Error, Result};
use crate::loopback::ensure_loopback;
use crate::netlink::{Kernel, Link, NetHandle, ensure_address, is_link_local};
use crate::underlay::{UnderlayParams, underlay_marker};
use crate::veth::ensure_namespaced_veth;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const UL_HOST: &str = "ul-host";
pub const UL_PE: &str = "ul-pe";

/// Steering programs together with the interfaces they were attached to.
pub struct SharedManager {
    steering: Box<dyn Steering>,
    nic_index: u32,
    ul_host_index: u32,
}

impl SharedManager {
    pub fn nic_index(&self) -> u32 {
        self.nic_index
    }

    pub fn ul_host_index(&self) -> u32 {
        self.ul_host_index
    }

    fn matches(&self, nic_index: u32, ul_host_index: u32) -> bool {
        self.nic_index == nic_index && self.ul_host_index == ul_host_index
    }

    fn close(mut self) -> Result<()> {
        self.steering.close()
    }
}

impl fmt::Debug for SharedManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedManager")
            .field("nic_index", &self.nic_index)
            .field("ul_host_index", &self.ul_host_index)
            .finish()
    }
}

/// At most one manager per process.
pub type ManagerSlot = Mutex<Option<SharedManager>>;

/// Wire the host NIC to the router namespace through `ul-host`/`ul-pe`.
///
/// `ul-pe` takes over the NIC's MTU, MAC and addresses so the router
/// appears on the wire as the NIC itself. The steering programs are
/// (re)loaded when the NIC or `ul-host` index changed.
pub async fn setup_shared_underlay(
    kernel: &dyn Kernel,
    loader: &dyn SteeringLoader,
    slot: &ManagerSlot,
    params: &UnderlayParams,
) -> Result<()> {
    debug!(nic = %params.underlay_interface, netns = %params.target_ns, "setting up shared underlay");
    let host = kernel.host().await?;
    let target = kernel.namespace(&params.target_ns).await?;

    let nic = host.require_link(&params.underlay_interface).await?;
    let (ul_host, ul_pe) =
        ensure_namespaced_veth(host.as_ref(), target.as_ref(), UL_HOST, UL_PE).await?;

    mirror_nic(host.as_ref(), target.as_ref(), &nic, &ul_host, &ul_pe).await?;
    host.set_up(ul_host.index).await?;
    target.set_up(ul_pe.index).await?;

    {
        let mut guard = slot.lock().await;
        let manager = ensure_manager(&mut guard, loader, nic.index, ul_host.index)?;
        manager.steering.update_neighbors(&params.neighbor_ips)?;
    }

    if let Some(evpn) = &params.evpn {
        ensure_loopback(target.as_ref(), evpn.vtep_ip).await?;
    }
    info!(nic = %nic.name, netns = %params.target_ns, "shared underlay ready");
    Ok(())
}

async fn mirror_nic(
    host: &dyn NetHandle,
    target: &dyn NetHandle,
    nic: &Link,
    ul_host: &Link,
    ul_pe: &Link,
) -> Result<()> {
    if ul_host.mtu != nic.mtu {
        host.set_mtu(ul_host.index, nic.mtu).await?;
    }
    if ul_pe.mtu != nic.mtu {
        target.set_mtu(ul_pe.index, nic.mtu).await?;
    }
    if let Some(mac) = nic.mac
        && ul_pe.mac != Some(mac)
    {
        target.set_mac(ul_pe.index, mac).await?;
    }

    for addr in host.addresses(nic.index).await? {
        if is_link_local(&addr) {
            continue;
        }
        if let Err(e) = ensure_address(target, ul_pe.index, addr).await {
            debug!(addr = %addr, error = %e, "failed to copy NIC address to {UL_PE}");
        }
    }
    ensure_address(target, ul_pe.index, underlay_marker()).await?;
    Ok(())
}

/// The manager for `(nic_index, ul_host_index)`, replacing one built for
/// other interfaces.
///
/// The old programs are detached before the new ones load, so steering is
/// briefly absent during the swap.
fn ensure_manager<'a>(
    slot: &'a mut Option<SharedManager>,
    loader: &dyn SteeringLoader,
    nic_index: u32,
    ul_host_index: u32,
) -> Result<&'a mut SharedManager> {
    if let Some(current) = slot.take_if(|m| !m.matches(nic_index, ul_host_index)) {
        info!(
            old_nic = current.nic_index,
            old_ul_host = current.ul_host_index,
            nic_index,
            ul_host_index,
            "interface indexes changed, reloading steering programs"
        );
        if let Err(e) = current.close() {
            warn!(error = %e, "failed to close stale steering programs");
        }
    }

    if slot.is_none() {
        let steering = loader.load(nic_index, ul_host_index)?;
        info!(nic_index, ul_host_index, "steering programs loaded");
        *slot = Some(SharedManager {
            steering,
            nic_index,
            ul_host_index,
        });
    }
    slot.as_mut()
        .ok_or(Error::SharedUnderlayNotInitialized)
}

/// Point VXLAN steering at exactly `vnis`.
pub async fn update_shared_underlay_vnis(slot: &ManagerSlot, vnis: &[u32]) -> Result<()> {
    let mut guard = slot.lock().await;
    let manager = guard.as_mut().ok_or(Error::SharedUnderlayNotInitialized)?;
    manager.steering.update_vnis(vnis)?;
    debug!(?vnis, "shared underlay VNIs updated");
    Ok(())
}

/// Detach the steering programs and delete the `ul-host`/`ul-pe` pair.
pub async fn remove_shared_underlay(kernel: &dyn Kernel, slot: &ManagerSlot) -> Result<()> {
    let mut errors = Vec::new();

    if let Some(manager) = slot.lock().await.take()
        && let Err(e) = manager.close()
    {
        warn!(error = %e, "failed to close steering programs");
        errors.push(e);
    }

    let host = kernel.host().await?;
    if let Some(link) = host.link_by_name(UL_HOST).await? {
        match host.delete_link(link.index).await {
            Ok(()) => info!("{UL_HOST} deleted"),
            Err(e) => {
                warn!(error = %e, "failed to delete {UL_HOST}");
                errors.push(e);
            }
        }
    }
    Error::join(errors)
}

/// Close the manager, if any.
pub async fn close_manager(slot: &ManagerSlot) -> Result<()> {
    match slot.lock().await.take() {
        Some(manager) => manager.close(),
        None => Ok(()),
    }
}
