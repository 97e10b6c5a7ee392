//! L2/L3 VNI reconciliation against the in-memory kernel.
//!
//! Covers graph construction, idempotence of repeated passes and the
//! convergent cleanup of removed VNIs.

use ipnet::IpNet;
use perouter_hostnet::bridge::fixed_bridge_mac;
use perouter_hostnet::test_util::FakeKernel;
use perouter_hostnet::underlay::{EvpnParams, NicMode, UnderlayParams, setup_underlay};
use perouter_hostnet::vni::{
    HostMaster, HostMasterKind, L2VniParams, L3VniParams, VethAddresses, VniParams, VtepSource,
    remove_non_configured_vnis, setup_l2_vni, setup_l3_vni,
};
use perouter_hostnet::{Error, NsPath};

const NIC_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x01];
const VTEP: &str = "10.0.0.1/32";

fn ns() -> NsPath {
    NsPath::new("perouter")
}

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

/// Router namespace with the underlay moved in and `lound` carrying the VTEP.
async fn router() -> FakeKernel {
    let kernel = FakeKernel::new();
    kernel.add_namespace(&ns());
    kernel.add_nic(None, "eth1", NIC_MAC, 9000, &[]);
    setup_underlay(
        &kernel,
        &UnderlayParams {
            underlay_interface: "eth1".into(),
            target_ns: ns(),
            evpn: Some(EvpnParams { vtep_ip: net(VTEP) }),
            neighbor_ips: vec![],
            nic_mode: NicMode::Dedicated,
        },
    )
    .await
    .unwrap();
    kernel
}

fn base(vrf: &str, vni: u32) -> VniParams {
    VniParams {
        vrf: vrf.into(),
        target_ns: ns(),
        vtep: VtepSource::Ip(net(VTEP)),
        vni,
        vxlan_port: 4789,
    }
}

fn l3(vrf: &str, vni: u32) -> L3VniParams {
    L3VniParams {
        base: base(vrf, vni),
        veth: Some(VethAddresses {
            host_ipv4: Some(net("192.168.9.2/24")),
            ns_ipv4: Some(net("192.168.9.1/24")),
            host_ipv6: Some(net("fd00:9::2/64")),
            ns_ipv6: Some(net("fd00:9::1/64")),
        }),
    }
}

fn l2(vrf: &str, vni: u32, host_master: Option<HostMaster>) -> L2VniParams {
    L2VniParams {
        base: base(vrf, vni),
        gateway_ips: vec![net("192.168.20.1/24")],
        host_master,
    }
}

fn auto(kind: HostMasterKind) -> Option<HostMaster> {
    Some(HostMaster {
        kind,
        auto_create: true,
        name: None,
    })
}

#[tokio::test]
async fn test_l3_vni_graph() {
    let kernel = router().await;
    let ns = ns();
    let ns = Some(&ns);

    setup_l3_vni(&kernel, &l3("red", 100)).await.unwrap();

    let vrf = kernel.link(ns, "red").expect("VRF created");
    let bridge = kernel.link(ns, "br-pe-100").expect("bridge created");
    let vxlan = kernel.link(ns, "vni100").expect("vxlan created");
    let pe = kernel.link(ns, "pe100").expect("pe leg moved");

    assert!(vrf.is_vrf());
    assert_eq!(bridge.master, Some(vrf.index));
    assert_eq!(vxlan.master, Some(bridge.index));
    assert_eq!(pe.master, Some(vrf.index), "L3 pe leg is a VRF port");
    assert!(kernel.neigh_suppress(ns, "vni100"));
    assert!(kernel.addr_gen_mode_none(ns, "vni100"));
    assert!(kernel.addr_gen_mode_none(ns, "br-pe-100"));

    assert_eq!(
        kernel.addresses(ns, "pe100"),
        vec![net("192.168.9.1/24"), net("fd00:9::1/64")]
    );
    assert_eq!(
        kernel.addresses(None, "host100"),
        vec![net("192.168.9.2/24"), net("fd00:9::2/64")]
    );
    assert!(kernel.is_up(None, "host100"));
    assert!(kernel.is_up(ns, "pe100"));
}

#[tokio::test]
async fn test_l3_vni_idempotent() {
    let kernel = router().await;
    let params = l3("red", 100);

    setup_l3_vni(&kernel, &params).await.unwrap();
    let changes = kernel.change_count();
    setup_l3_vni(&kernel, &params).await.unwrap();

    assert_eq!(
        kernel.change_count(),
        changes,
        "second pass changed: {:?}",
        &kernel.changes()[changes..]
    );
}

#[tokio::test]
async fn test_l3_vni_without_veth() {
    let kernel = router().await;
    let params = L3VniParams {
        base: base("red", 100),
        veth: None,
    };

    setup_l3_vni(&kernel, &params).await.unwrap();

    assert!(kernel.link(Some(&ns()), "vni100").is_some());
    assert!(kernel.link(None, "host100").is_none());
}

#[tokio::test]
async fn test_l3_vni_dropping_veth_removes_pair() {
    let kernel = router().await;
    let ns = ns();
    setup_l3_vni(&kernel, &l3("red", 100)).await.unwrap();
    assert!(kernel.link(None, "host100").is_some());

    let params = L3VniParams {
        base: base("red", 100),
        veth: None,
    };
    setup_l3_vni(&kernel, &params).await.unwrap();

    assert!(kernel.link(None, "host100").is_none());
    assert!(kernel.link(Some(&ns), "pe100").is_none());
    assert!(kernel.link(Some(&ns), "vni100").is_some());
    assert!(kernel.link(Some(&ns), "br-pe-100").is_some());

    let changes = kernel.change_count();
    setup_l3_vni(&kernel, &params).await.unwrap();
    assert_eq!(kernel.change_count(), changes);
}

#[tokio::test]
async fn test_l3_vni_rejects_empty_leg() {
    let kernel = router().await;
    let mut params = l3("red", 100);
    params.veth = Some(VethAddresses {
        host_ipv4: Some(net("192.168.9.2/24")),
        ..Default::default()
    });
    let changes = kernel.change_count();

    let err = setup_l3_vni(&kernel, &params).await.unwrap_err();

    assert!(matches!(err, Error::InvalidParams(_)));
    assert_eq!(kernel.change_count(), changes, "nothing touched");
}

#[tokio::test]
async fn test_l3_vni_without_vtep_loopback() {
    let kernel = FakeKernel::new();
    kernel.add_namespace(&ns());

    let err = setup_l3_vni(&kernel, &l3("red", 100)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_l2_vni_with_linux_host_bridge() {
    let kernel = router().await;
    let ns = ns();
    let ns = Some(&ns);

    setup_l2_vni(&kernel, &l2("red", 200, auto(HostMasterKind::LinuxBridge)))
        .await
        .unwrap();

    let bridge = kernel.link(ns, "br-pe-200").unwrap();
    let pe = kernel.link(ns, "pe200").unwrap();
    assert_eq!(pe.master, Some(bridge.index), "L2 pe leg is a bridge port");
    assert_eq!(bridge.mac, Some(fixed_bridge_mac(200)));
    assert_eq!(kernel.addresses(ns, "br-pe-200"), vec![net("192.168.20.1/24")]);

    let host_bridge = kernel.link(None, "br-hs-200").expect("host bridge created");
    assert!(host_bridge.is_bridge());
    assert_eq!(
        kernel.link(None, "host200").unwrap().master,
        Some(host_bridge.index)
    );
}

#[tokio::test]
async fn test_l2_vni_idempotent() {
    let kernel = router().await;
    let params = l2("red", 200, auto(HostMasterKind::LinuxBridge));

    setup_l2_vni(&kernel, &params).await.unwrap();
    let changes = kernel.change_count();
    setup_l2_vni(&kernel, &params).await.unwrap();

    assert_eq!(
        kernel.change_count(),
        changes,
        "second pass changed: {:?}",
        &kernel.changes()[changes..]
    );
}

#[tokio::test]
async fn test_l2_vni_with_ovs_host_bridge() {
    let kernel = router().await;

    setup_l2_vni(&kernel, &l2("red", 300, auto(HostMasterKind::Ovs)))
        .await
        .unwrap();

    assert_eq!(kernel.ovs_ports("br-hs-300"), Some(vec!["host300".to_string()]));
}

#[tokio::test]
async fn test_l2_vni_with_named_linux_bridge() {
    let kernel = router().await;
    let index = kernel.add_link(None, "br-vms", perouter_hostnet::netlink::LinkKind::Bridge);
    let master = Some(HostMaster {
        kind: HostMasterKind::LinuxBridge,
        auto_create: false,
        name: Some("br-vms".into()),
    });

    setup_l2_vni(&kernel, &l2("red", 200, master)).await.unwrap();

    assert_eq!(kernel.link(None, "host200").unwrap().master, Some(index));
    assert!(kernel.link(None, "br-hs-200").is_none());
}

#[tokio::test]
async fn test_l2_vni_host_master_errors() {
    let kernel = router().await;

    let unnamed = Some(HostMaster {
        kind: HostMasterKind::LinuxBridge,
        auto_create: false,
        name: None,
    });
    let err = setup_l2_vni(&kernel, &l2("red", 200, unnamed))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParams(_)));

    let missing_ovs = Some(HostMaster {
        kind: HostMasterKind::Ovs,
        auto_create: false,
        name: Some("br-int".into()),
    });
    let err = setup_l2_vni(&kernel, &l2("red", 201, missing_ovs))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ovs { .. }));
}

#[tokio::test]
async fn test_remove_non_configured_vnis() {
    let kernel = router().await;
    let ns = ns();
    let keep = l3("red", 100);

    setup_l3_vni(&kernel, &keep).await.unwrap();
    setup_l2_vni(&kernel, &l2("red", 200, auto(HostMasterKind::Ovs)))
        .await
        .unwrap();
    setup_l2_vni(&kernel, &l2("blue", 300, auto(HostMasterKind::LinuxBridge)))
        .await
        .unwrap();
    // Not ours: no numeric suffix.
    kernel.add_link(None, "br-hs-mgmt", perouter_hostnet::netlink::LinkKind::Bridge);

    remove_non_configured_vnis(&kernel, &ns, &[keep.base.clone()])
        .await
        .unwrap();

    let host = kernel.link_names(None);
    for gone in ["host200", "host300", "br-hs-200", "br-hs-300"] {
        assert!(!host.contains(&gone.to_string()), "{gone} still on host");
    }
    assert!(kernel.ovs_ports("br-hs-200").is_none());
    assert!(host.contains(&"host100".to_string()));
    assert!(host.contains(&"br-hs-mgmt".to_string()));

    let router = kernel.link_names(Some(&ns));
    for gone in ["vni200", "br-pe-200", "pe200", "vni300", "br-pe-300", "pe300", "blue"] {
        assert!(!router.contains(&gone.to_string()), "{gone} still in router");
    }
    for kept in ["red", "vni100", "br-pe-100", "pe100", "lound", "eth1"] {
        assert!(router.contains(&kept.to_string()), "{kept} removed");
    }

    // Converged: a second pass finds nothing to do.
    let changes = kernel.change_count();
    remove_non_configured_vnis(&kernel, &ns, &[keep.base.clone()])
        .await
        .unwrap();
    assert_eq!(kernel.change_count(), changes);
}

#[tokio::test]
async fn test_remove_continues_past_failures() {
    let kernel = router().await;
    let ns = ns();
    setup_l2_vni(&kernel, &l2("red", 200, None)).await.unwrap();
    kernel.fail_delete("vni200");

    let err = remove_non_configured_vnis(&kernel, &ns, &[])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Netlink { .. }), "got {err}");
    let router = kernel.link_names(Some(&ns));
    assert!(router.contains(&"vni200".to_string()));
    assert!(!router.contains(&"br-pe-200".to_string()));
    assert!(!router.contains(&"red".to_string()));
    assert!(kernel.link(None, "host200").is_none());
}
