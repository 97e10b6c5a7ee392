//! Desired state file read by the binary.
//!
//! ```json
//! {
//!   "underlay": {"underlay_interface": "eth1", "target_ns": "perouter",
//!                "evpn": {"vtep_ip": "10.0.0.1/32"}},
//!   "l3vnis": [{"vrf": "red", "target_ns": "perouter", "vtep": {"ip": "10.0.0.1/32"},
//!               "vni": 100, "vxlan_port": 4789}],
//!   "l2vnis": []
//! }
//! ```

use crate::error::Result;
use crate::netns::NsPath;
use crate::underlay::UnderlayParams;
use crate::vni::{L2VniParams, L3VniParams, VniParams};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub underlay: Option<UnderlayParams>,
    #[serde(default)]
    pub l3vnis: Vec<L3VniParams>,
    #[serde(default)]
    pub l2vnis: Vec<L2VniParams>,
}

impl DesiredState {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Base parameters of every configured VNI, L3 first.
    pub fn vni_params(&self) -> Vec<VniParams> {
        self.l3vnis
            .iter()
            .map(|p| p.base.clone())
            .chain(self.l2vnis.iter().map(|p| p.base.clone()))
            .collect()
    }

    pub fn vnis(&self) -> Vec<u32> {
        self.vni_params().iter().map(|p| p.vni).collect()
    }

    /// The router namespace: the underlay's, else the first VNI's.
    pub fn target_ns(&self) -> Option<&NsPath> {
        self.underlay
            .as_ref()
            .map(|u| &u.target_ns)
            .or_else(|| self.l3vnis.first().map(|p| &p.base.target_ns))
            .or_else(|| self.l2vnis.first().map(|p| &p.base.target_ns))
    }
}
