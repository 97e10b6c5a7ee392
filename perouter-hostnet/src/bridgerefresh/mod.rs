//! Keeps STALE neighbours on the L2 VNI bridges alive.
//!
//! The router only learns a MAC/IP binding when the host answers an ARP
//! request. Bindings that age into STALE would eventually be dropped and
//! withdrawn from EVPN, so each L2 VNI runs a refresher that probes them
//! with unicast ARP from the gateway address.

pub mod arp;
pub mod neighbor;
pub mod refresher;
pub mod registry;

pub use neighbor::{StaleNeighbour, stale_neighbors};
pub use refresher::{BridgeRefresher, DEFAULT_REFRESH_PERIOD, StartOptions};
pub use registry::RefresherRegistry;
