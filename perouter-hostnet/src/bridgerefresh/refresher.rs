use super::neighbor::stale_neighbors;
use crate::bridge::bridge_name;
use crate::error::{Error, Result};
use crate::netlink::{ArpRequest, Kernel};
use crate::netns::NsPath;
use crate::vni::L2VniParams;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Overrides [`DEFAULT_REFRESH_PERIOD`].
    pub refresh_period: Option<Duration>,
}

/// Periodic ARP prober for the bridge of one L2 VNI.
pub struct BridgeRefresher {
    vni: u32,
    probe: Arc<Probe>,
    refresh_period: Duration,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// What one tick needs, shared with the background task.
struct Probe {
    kernel: Arc<dyn Kernel>,
    namespace: NsPath,
    bridge_name: String,
    gateway_ips: Vec<Ipv4Addr>,
}

impl BridgeRefresher {
    pub fn new(kernel: Arc<dyn Kernel>, params: &L2VniParams, options: StartOptions) -> Self {
        let gateway_ips = params
            .gateway_ips
            .iter()
            .filter_map(|net| match net.addr() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect();

        Self {
            vni: params.base.vni,
            probe: Arc::new(Probe {
                kernel,
                namespace: params.base.target_ns.clone(),
                bridge_name: bridge_name(params.base.vni),
                gateway_ips,
            }),
            refresh_period: options.refresh_period.unwrap_or(DEFAULT_REFRESH_PERIOD),
            cancel: None,
            task: None,
        }
    }

    pub fn vni(&self) -> u32 {
        self.vni
    }

    pub fn bridge_name(&self) -> &str {
        &self.probe.bridge_name
    }

    pub fn refresh_period(&self) -> Duration {
        self.refresh_period
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Spawn the refresh loop. The first tick fires one period from now.
    /// Does nothing if already running.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        if self.probe.gateway_ips.is_empty() {
            info!(
                vni = self.vni,
                bridge = %self.probe.bridge_name,
                "no IPv4 gateway, stale neighbours will not be probed"
            );
        }

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let probe = Arc::clone(&self.probe);
        let period = self.refresh_period;
        let vni = self.vni;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = ticker.tick() => {
                        match probe.refresh().await {
                            Ok(0) => {}
                            Ok(sent) => debug!(vni, sent, "stale neighbours probed"),
                            Err(e) => warn!(vni, error = %e, "neighbour refresh failed"),
                        }
                    }
                }
            }
            debug!(vni, "refresher stopped");
        });

        debug!(vni, period = ?period, "refresher started");
        self.cancel = Some(cancel_tx);
        self.task = Some(task);
    }

    /// Signal the loop to stop and wait for it to finish.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            // The task may already be gone.
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(vni = self.vni, error = %e, "refresher task failed");
        }
    }

    /// Run one tick now. Returns the number of ARP requests sent.
    pub async fn refresh_now(&self) -> Result<usize> {
        self.probe.refresh().await
    }
}

impl Drop for BridgeRefresher {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl Probe {
    async fn refresh(&self) -> Result<usize> {
        let Some(sender_ip) = self.gateway_ips.first().copied() else {
            return Ok(0);
        };

        let nl = self.kernel.namespace(&self.namespace).await?;
        let bridge = nl.require_link(&self.bridge_name).await?;
        let sender_mac = bridge
            .mac
            .ok_or_else(|| Error::InvalidParams(format!("{} has no MAC", self.bridge_name)))?;

        let stale = stale_neighbors(&nl.neighbours(bridge.index).await?);
        let mut sent = 0;
        for neighbour in &stale {
            let request = ArpRequest {
                sender_mac,
                sender_ip,
                target_mac: neighbour.mac,
                target_ip: neighbour.ip,
            };
            if let Err(e) = nl.send_arp(bridge.index, &request).await {
                warn!(
                    bridge = %self.bridge_name,
                    target = %neighbour.ip,
                    error = %e,
                    "ARP refresh failed"
                );
                continue;
            }
            sent += 1;
        }
        Ok(sent)
    }
}
