//! Per-process dataplane context.

use crate::bpf::SteeringLoader;
use crate::bridgerefresh::RefresherRegistry;
use crate::error::Result;
use crate::loopback::{self, LoopbackParams};
use crate::netlink::Kernel;
use crate::netns::NsPath;
use crate::shared::{self, ManagerSlot};
use crate::underlay::{self, NicParams, UnderlayParams};
use crate::vni::{self, L2VniParams, L3VniParams, VniParams};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Entry point for every reconciliation operation.
///
/// Owns the shared-NIC steering manager and the refresher registry.
/// Everything else is re-read from the kernel on each call.
pub struct HostDataplane {
    kernel: Arc<dyn Kernel>,
    steering_loader: Box<dyn SteeringLoader>,
    shared: ManagerSlot,
    refreshers: RefresherRegistry,
}

impl HostDataplane {
    pub fn new(kernel: Arc<dyn Kernel>, steering_loader: Box<dyn SteeringLoader>) -> Self {
        Self {
            refreshers: RefresherRegistry::new(Arc::clone(&kernel)),
            kernel,
            steering_loader,
            shared: Mutex::new(None),
        }
    }

    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    pub fn refreshers(&self) -> &RefresherRegistry {
        &self.refreshers
    }

    pub async fn setup_l3_vni(&self, params: &L3VniParams) -> Result<()> {
        vni::setup_l3_vni(self.kernel(), params).await
    }

    pub async fn setup_l2_vni(&self, params: &L2VniParams) -> Result<()> {
        vni::setup_l2_vni(self.kernel(), params).await
    }

    pub async fn remove_non_configured_vnis(
        &self,
        target_ns: &NsPath,
        keep: &[VniParams],
    ) -> Result<()> {
        vni::remove_non_configured_vnis(self.kernel(), target_ns, keep).await
    }

    pub async fn setup_nic(&self, params: &NicParams) -> Result<()> {
        underlay::setup_nic(self.kernel(), params).await
    }

    pub async fn setup_underlay(&self, params: &UnderlayParams) -> Result<()> {
        underlay::setup_underlay(self.kernel(), params).await
    }

    pub async fn setup_loopback(&self, params: &LoopbackParams) -> Result<()> {
        loopback::setup_loopback(self.kernel(), params).await
    }

    pub async fn has_underlay_interface(&self, ns: &NsPath) -> Result<bool> {
        underlay::has_underlay_interface(self.kernel(), ns).await
    }

    pub async fn setup_shared_underlay(&self, params: &UnderlayParams) -> Result<()> {
        shared::setup_shared_underlay(
            self.kernel(),
            self.steering_loader.as_ref(),
            &self.shared,
            params,
        )
        .await
    }

    pub async fn update_shared_underlay_vnis(&self, vnis: &[u32]) -> Result<()> {
        shared::update_shared_underlay_vnis(&self.shared, vnis).await
    }

    pub async fn remove_shared_underlay(&self) -> Result<()> {
        shared::remove_shared_underlay(self.kernel(), &self.shared).await
    }

    /// Whether steering programs are loaded.
    pub async fn has_shared_manager(&self) -> bool {
        self.shared.lock().await.is_some()
    }

    /// Stop every refresher and detach the steering programs. Interfaces are
    /// left in place.
    pub async fn shutdown(&self) {
        self.refreshers.stop_all().await;
        if let Err(e) = shared::close_manager(&self.shared).await {
            warn!(error = %e, "failed to close steering programs");
        }
        info!("dataplane shut down");
    }
}
