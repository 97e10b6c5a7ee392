//! perouter-hostnet: host-side dataplane of a per-node provider edge router.
//!
//! Builds and converges the kernel objects a routing daemon in its own
//! network namespace needs to act as an EVPN PE for the node:
//!
//! ```text
//!  host ns                      router ns
//!  ───────                      ─────────
//!  host<VNI> ==veth==> pe<VNI> ─┐
//!                               ├─ br-pe-<VNI> ─ VRF ─┐
//!                vni<VNI> (VXLAN, src = lound) ───────┘
//!  eth1 ──────── moved in (dedicated) ─────────────> eth1 (+ 172.16.1.1/32)
//!  eth1 ─ eBPF ─ ul-host ==veth==> ul-pe (shared)
//! ```
//!
//! Every setup operation is idempotent: existing objects of the right kind
//! are kept, objects of the wrong kind are recreated, missing ones created.

pub mod bpf;
pub mod bridge;
pub mod bridgerefresh;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod ipam;
pub mod loopback;
pub mod netlink;
pub mod netns;
pub mod ovs;
pub mod shared;
pub mod sysctl;
pub mod underlay;
pub mod veth;
pub mod vni;
pub mod vrf;
pub mod vxlan;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use bpf::{BpfManager, BpfSteeringLoader, Steering, SteeringLoader, SteeringObjects};
pub use bridgerefresh::{BridgeRefresher, RefresherRegistry, StartOptions};
pub use config::DesiredState;
pub use dataplane::HostDataplane;
pub use error::{BpfError, Error, Result};
pub use loopback::LoopbackParams;
pub use netlink::{Kernel, NetHandle, SystemKernel};
pub use netns::NsPath;
pub use underlay::{EvpnParams, NicMode, NicParams, UnderlayParams};
pub use vni::{
    HostMaster, HostMasterKind, L2VniParams, L3VniParams, VethAddresses, VniParams, VtepSource,
};
