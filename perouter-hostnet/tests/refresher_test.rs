//! Bridge neighbour refresher and its registry.

use perouter_hostnet::bridgerefresh::{BridgeRefresher, RefresherRegistry, StartOptions};
use perouter_hostnet::netlink::{LinkKind, MacAddr, Neighbour, NeighbourState};
use perouter_hostnet::test_util::FakeKernel;
use perouter_hostnet::{L2VniParams, NsPath, VniParams, VtepSource};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

const HOST_MAC: MacAddr = [0x52, 0x54, 0x00, 0x00, 0x00, 0x42];

fn ns() -> NsPath {
    NsPath::new("perouter")
}

fn l2(vni: u32, gateways: &[&str]) -> L2VniParams {
    L2VniParams {
        base: VniParams {
            vrf: "red".into(),
            target_ns: ns(),
            vtep: VtepSource::Ip("10.0.0.1/32".parse().unwrap()),
            vni,
            vxlan_port: 4789,
        },
        gateway_ips: gateways.iter().map(|g| g.parse().unwrap()).collect(),
        host_master: None,
    }
}

fn neighbour(ip: &str, state: NeighbourState) -> Neighbour {
    Neighbour {
        ip: Some(ip.parse().unwrap()),
        mac: Some(HOST_MAC),
        state,
    }
}

/// Router namespace with `br-pe-200` and two neighbours, one of them stale.
fn kernel_with_bridge() -> FakeKernel {
    let kernel = FakeKernel::new();
    let ns = ns();
    kernel.add_namespace(&ns);
    kernel.add_link(Some(&ns), "br-pe-200", LinkKind::Bridge);
    kernel.set_neighbours(
        Some(&ns),
        "br-pe-200",
        vec![
            neighbour("192.168.20.10", NeighbourState::Stale),
            neighbour("192.168.20.11", NeighbourState::Reachable),
        ],
    );
    kernel
}

fn fast() -> StartOptions {
    StartOptions {
        refresh_period: Some(Duration::from_millis(20)),
    }
}

#[tokio::test]
async fn test_stale_neighbour_is_probed() {
    let kernel = kernel_with_bridge();
    let bridge = kernel.link(Some(&ns()), "br-pe-200").unwrap();
    let refresher = BridgeRefresher::new(
        Arc::new(kernel.clone()),
        &l2(200, &["fd00:20::1/64", "192.168.20.1/24"]),
        StartOptions::default(),
    );

    assert_eq!(refresher.refresh_now().await.unwrap(), 1);

    let sent = kernel.sent_arps();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].namespace, Some(ns()));
    assert_eq!(sent[0].index, bridge.index);
    let request = sent[0].request;
    assert_eq!(request.sender_ip, Ipv4Addr::new(192, 168, 20, 1));
    assert_eq!(Some(request.sender_mac), bridge.mac);
    assert_eq!(request.target_ip, Ipv4Addr::new(192, 168, 20, 10));
    assert_eq!(request.target_mac, HOST_MAC);
}

#[tokio::test]
async fn test_failed_send_does_not_skip_other_neighbours() {
    let kernel = kernel_with_bridge();
    kernel.set_neighbours(
        Some(&ns()),
        "br-pe-200",
        vec![
            neighbour("192.168.20.10", NeighbourState::Stale),
            neighbour("192.168.20.12", NeighbourState::Stale),
        ],
    );
    kernel.fail_arp(Ipv4Addr::new(192, 168, 20, 10));
    let refresher = BridgeRefresher::new(
        Arc::new(kernel.clone()),
        &l2(200, &["192.168.20.1/24"]),
        StartOptions::default(),
    );

    assert_eq!(refresher.refresh_now().await.unwrap(), 1);

    let targets: Vec<Ipv4Addr> = kernel
        .sent_arps()
        .iter()
        .map(|arp| arp.request.target_ip)
        .collect();
    assert_eq!(targets, vec![Ipv4Addr::new(192, 168, 20, 12)]);
}

#[tokio::test]
async fn test_no_ipv4_gateway_means_no_probes() {
    let kernel = kernel_with_bridge();
    let refresher = BridgeRefresher::new(
        Arc::new(kernel.clone()),
        &l2(200, &["fd00:20::1/64"]),
        StartOptions::default(),
    );

    assert_eq!(refresher.refresh_now().await.unwrap(), 0);
    assert!(kernel.sent_arps().is_empty());
}

#[tokio::test]
async fn test_missing_bridge() {
    let kernel = kernel_with_bridge();
    let refresher = BridgeRefresher::new(
        Arc::new(kernel.clone()),
        &l2(300, &["192.168.30.1/24"]),
        StartOptions::default(),
    );

    let err = refresher.refresh_now().await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_periodic_refresh_and_stop() {
    let kernel = kernel_with_bridge();
    let mut refresher =
        BridgeRefresher::new(Arc::new(kernel.clone()), &l2(200, &["192.168.20.1/24"]), fast());
    assert_eq!(refresher.refresh_period(), Duration::from_millis(20));

    refresher.start();
    assert!(refresher.is_running());
    tokio::time::sleep(Duration::from_millis(150)).await;
    refresher.stop().await;

    assert!(!refresher.is_running());
    let sent = kernel.sent_arps().len();
    assert!(sent >= 2, "expected repeated probes, got {sent}");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(kernel.sent_arps().len(), sent, "no probes after stop");
}

#[tokio::test]
async fn test_errors_do_not_stop_the_loop() {
    let kernel = FakeKernel::new();
    kernel.add_namespace(&ns());
    let mut refresher =
        BridgeRefresher::new(Arc::new(kernel.clone()), &l2(200, &["192.168.20.1/24"]), fast());

    // The bridge shows up after the loop started failing.
    refresher.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    kernel.add_link(Some(&ns()), "br-pe-200", LinkKind::Bridge);
    kernel.set_neighbours(
        Some(&ns()),
        "br-pe-200",
        vec![neighbour("192.168.20.10", NeighbourState::Stale)],
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    refresher.stop().await;

    assert!(!kernel.sent_arps().is_empty());
}

#[tokio::test]
async fn test_registry_lifecycle() {
    let kernel = kernel_with_bridge();
    let registry = RefresherRegistry::new(Arc::new(kernel.clone()));

    registry.start_for_vni(&l2(200, &["192.168.20.1/24"]), fast()).await;
    registry.start_for_vni(&l2(200, &["192.168.20.1/24"]), fast()).await;
    assert_eq!(registry.active_count().await, 1, "restart replaces");

    registry.start_for_vni(&l2(300, &[]), fast()).await;
    registry.start_for_vni(&l2(400, &[]), fast()).await;
    assert_eq!(registry.active_vnis().await, vec![200, 300, 400]);

    registry
        .stop_for_removed_vnis(&[l2(200, &[]), l2(400, &[])])
        .await;
    assert_eq!(registry.active_vnis().await, vec![200, 400]);

    registry.stop_for_vni(400).await;
    registry.stop_for_vni(999).await;
    assert_eq!(registry.active_vnis().await, vec![200]);

    registry.stop_all().await;
    assert_eq!(registry.active_count().await, 0);
}
