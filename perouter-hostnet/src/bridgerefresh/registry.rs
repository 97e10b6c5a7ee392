use super::refresher::{BridgeRefresher, StartOptions};
use crate::netlink::Kernel;
use crate::vni::L2VniParams;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Running refreshers by VNI.
pub struct RefresherRegistry {
    kernel: Arc<dyn Kernel>,
    active: Mutex<HashMap<u32, BridgeRefresher>>,
}

impl RefresherRegistry {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self {
            kernel,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start a refresher for `params`, replacing any running one for the
    /// same VNI.
    pub async fn start_for_vni(&self, params: &L2VniParams, options: StartOptions) {
        let vni = params.base.vni;
        let mut active = self.active.lock().await;
        if let Some(mut old) = active.remove(&vni) {
            old.stop().await;
        }

        let mut refresher = BridgeRefresher::new(Arc::clone(&self.kernel), params, options);
        refresher.start();
        info!(vni, bridge = %refresher.bridge_name(), "bridge refresher started");
        active.insert(vni, refresher);
    }

    pub async fn stop_for_vni(&self, vni: u32) {
        let removed = self.active.lock().await.remove(&vni);
        if let Some(mut refresher) = removed {
            refresher.stop().await;
            info!(vni, "bridge refresher stopped");
        }
    }

    /// Stop refreshers whose VNI is not in `configured`.
    pub async fn stop_for_removed_vnis(&self, configured: &[L2VniParams]) {
        let keep: HashSet<u32> = configured.iter().map(|p| p.base.vni).collect();
        let mut active = self.active.lock().await;
        let removed: Vec<u32> = active
            .keys()
            .filter(|vni| !keep.contains(vni))
            .copied()
            .collect();

        for vni in removed {
            if let Some(mut refresher) = active.remove(&vni) {
                refresher.stop().await;
                info!(vni, "bridge refresher stopped, VNI removed");
            }
        }
    }

    pub async fn stop_all(&self) {
        let mut active = self.active.lock().await;
        for (vni, mut refresher) in active.drain() {
            refresher.stop().await;
            info!(vni, "bridge refresher stopped");
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn active_vnis(&self) -> Vec<u32> {
        let mut vnis: Vec<u32> = self.active.lock().await.keys().copied().collect();
        vnis.sort_unstable();
        vnis
    }
}
