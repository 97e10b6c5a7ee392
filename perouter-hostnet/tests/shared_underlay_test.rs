//! Shared-NIC underlay: veth wiring and steering program lifecycle.

use ipnet::IpNet;
use perouter_hostnet::shared::{UL_HOST, UL_PE};
use perouter_hostnet::test_util::{FakeKernel, FakeSteeringLoader};
use perouter_hostnet::underlay::underlay_marker;
use perouter_hostnet::{
    Error, EvpnParams, HostDataplane, Kernel, NetHandle, NicMode, NsPath, UnderlayParams,
};
use std::collections::BTreeSet;
use std::sync::Arc;

const NIC_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xab, 0xcd, 0xef];

fn ns() -> NsPath {
    NsPath::new("perouter")
}

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

struct Harness {
    kernel: FakeKernel,
    loader: FakeSteeringLoader,
    dataplane: HostDataplane,
    nic_index: u32,
}

fn setup() -> Harness {
    let kernel = FakeKernel::new();
    kernel.add_namespace(&ns());
    let nic_index = kernel.add_nic(
        None,
        "eth1",
        NIC_MAC,
        9000,
        &[net("192.168.1.10/24"), net("fe80::5054:ff:feab:cdef/64")],
    );
    let loader = FakeSteeringLoader::new();
    let dataplane = HostDataplane::new(Arc::new(kernel.clone()), Box::new(loader.clone()));
    Harness {
        kernel,
        loader,
        dataplane,
        nic_index,
    }
}

fn shared(neighbors: &[&str]) -> UnderlayParams {
    UnderlayParams {
        underlay_interface: "eth1".into(),
        target_ns: ns(),
        evpn: Some(EvpnParams {
            vtep_ip: net("10.0.0.1/32"),
        }),
        neighbor_ips: neighbors.iter().map(|ip| ip.parse().unwrap()).collect(),
        nic_mode: NicMode::Shared,
    }
}

#[tokio::test]
async fn test_shared_underlay_wiring() {
    let h = setup();
    let ns = ns();
    let ns = Some(&ns);

    h.dataplane
        .setup_shared_underlay(&shared(&["192.168.1.1", "fd00::1"]))
        .await
        .unwrap();

    // The NIC itself stays on the host.
    assert!(h.kernel.link(None, "eth1").is_some());

    let ul_host = h.kernel.link(None, UL_HOST).expect("ul-host on host");
    let ul_pe = h.kernel.link(ns, UL_PE).expect("ul-pe in router");
    assert_eq!(ul_host.mtu, 9000);
    assert_eq!(ul_pe.mtu, 9000);
    assert_eq!(ul_pe.mac, Some(NIC_MAC));
    assert_eq!(
        h.kernel.addresses(ns, UL_PE),
        vec![net("192.168.1.10/24"), underlay_marker()],
        "global NIC addresses and the marker, no link-local"
    );
    assert!(h.kernel.is_up(ns, UL_PE));
    assert!(h.kernel.link(ns, "lound").is_some());

    let state = h.loader.state();
    assert_eq!(state.loads, vec![(h.nic_index, ul_host.index)]);
    assert_eq!(state.neighbors, BTreeSet::from([[192, 168, 1, 1]]));
}

#[tokio::test]
async fn test_shared_underlay_idempotent() {
    let h = setup();
    let params = shared(&["192.168.1.1"]);

    h.dataplane.setup_shared_underlay(&params).await.unwrap();
    let changes = h.kernel.change_count();
    h.dataplane.setup_shared_underlay(&params).await.unwrap();

    assert_eq!(
        h.kernel.change_count(),
        changes,
        "second pass changed: {:?}",
        &h.kernel.changes()[changes..]
    );
    assert_eq!(h.loader.load_count(), 1, "programs loaded once");
}

#[tokio::test]
async fn test_neighbor_set_converges() {
    let h = setup();

    h.dataplane
        .setup_shared_underlay(&shared(&["192.168.1.1", "192.168.1.2"]))
        .await
        .unwrap();
    h.dataplane
        .setup_shared_underlay(&shared(&["192.168.1.2", "192.168.1.3"]))
        .await
        .unwrap();

    assert_eq!(
        h.loader.state().neighbors,
        BTreeSet::from([[192, 168, 1, 2], [192, 168, 1, 3]])
    );
}

#[tokio::test]
async fn test_vni_updates_require_manager() {
    let h = setup();

    let err = h
        .dataplane
        .update_shared_underlay_vnis(&[100])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SharedUnderlayNotInitialized));
}

#[tokio::test]
async fn test_vni_set_keeps_common_entries() {
    let h = setup();
    h.dataplane.setup_shared_underlay(&shared(&[])).await.unwrap();

    h.dataplane
        .update_shared_underlay_vnis(&[100, 200])
        .await
        .unwrap();
    h.dataplane
        .update_shared_underlay_vnis(&[200, 300])
        .await
        .unwrap();

    let state = h.loader.state();
    assert_eq!(state.vnis, BTreeSet::from([200, 300]));
    assert_eq!(state.removed_vnis, vec![100], "VNI 200 never left the map");
}

#[tokio::test]
async fn test_manager_reloaded_on_index_change() {
    let h = setup();
    h.dataplane.setup_shared_underlay(&shared(&[])).await.unwrap();
    let first = h.loader.state().loads[0];

    // Something else tore the veth down; it comes back with new indexes.
    let host = h.kernel.host().await.unwrap();
    let ul_host = h.kernel.link(None, UL_HOST).unwrap();
    host.delete_link(ul_host.index).await.unwrap();

    h.dataplane.setup_shared_underlay(&shared(&[])).await.unwrap();

    let state = h.loader.state();
    assert_eq!(state.loads.len(), 2);
    assert_ne!(state.loads[1], first);
    assert_eq!(state.closed, vec![first]);
}

#[tokio::test]
async fn test_remove_shared_underlay() {
    let h = setup();
    h.dataplane.setup_shared_underlay(&shared(&[])).await.unwrap();

    h.dataplane.remove_shared_underlay().await.unwrap();

    assert!(h.kernel.link(None, UL_HOST).is_none());
    assert!(h.kernel.link(Some(&ns()), UL_PE).is_none());
    assert!(!h.dataplane.has_shared_manager().await);
    assert_eq!(h.loader.state().closed.len(), 1);
    assert!(matches!(
        h.dataplane.update_shared_underlay_vnis(&[1]).await,
        Err(Error::SharedUnderlayNotInitialized)
    ));

    // Removing again is harmless.
    h.dataplane.remove_shared_underlay().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_manager() {
    let h = setup();
    h.dataplane.setup_shared_underlay(&shared(&[])).await.unwrap();

    h.dataplane.shutdown().await;

    assert!(!h.dataplane.has_shared_manager().await);
    assert_eq!(h.loader.state().closed.len(), 1);
    assert!(
        h.kernel.link(None, UL_HOST).is_some(),
        "interfaces survive shutdown"
    );
}
