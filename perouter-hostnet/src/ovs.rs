//! Open vSwitch bridge management through `ovs-vsctl`.

use crate::error::{Error, Result};
use tokio::process::Command;
use tracing::debug;

const OVS_VSCTL: &str = "ovs-vsctl";

fn add_bridge_args(name: &str) -> Vec<String> {
    vec!["--may-exist".into(), "add-br".into(), name.into()]
}

fn add_port_args(bridge: &str, port: &str) -> Vec<String> {
    vec![
        "--may-exist".into(),
        "add-port".into(),
        bridge.into(),
        port.into(),
    ]
}

fn del_bridge_args(name: &str) -> Vec<String> {
    vec!["--if-exists".into(), "del-br".into(), name.into()]
}

/// Create bridge `name` unless it exists.
pub async fn ensure_bridge(name: &str) -> Result<()> {
    run(&add_bridge_args(name)).await
}

/// Attach interface `port` to `bridge` unless it is attached already.
pub async fn add_port(bridge: &str, port: &str) -> Result<()> {
    run(&add_port_args(bridge, port)).await
}

pub async fn delete_bridge(name: &str) -> Result<()> {
    run(&del_bridge_args(name)).await
}

async fn run(args: &[String]) -> Result<()> {
    let joined = args.join(" ");
    debug!(args = %joined, "running ovs-vsctl");

    let output = Command::new(OVS_VSCTL)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Ovs {
            args: joined.clone(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Ovs {
            args: joined,
            reason: stderr.trim().to_string(),
        });
    }

    Ok(())
}
