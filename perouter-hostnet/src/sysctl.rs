//! Sysctl convergence inside a network namespace.
//!
//! `/proc/sys/net` shows the namespace of the thread that opens it, so every
//! read and write happens through [`in_namespace_path`].

use crate::error::{Error, Result};
use crate::netns::{NsPath, in_namespace_path};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

pub const PROC_SYS: &str = "/proc/sys";

const UNTRACKED_NA_WARNING: &str =
    "check if kernel is >= 5.18, layer 2 traffic might be impacted / mac learning might be slower";

/// One desired sysctl value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sysctl {
    /// Path below `/proc/sys`, e.g. `net/ipv4/conf/all/forwarding`.
    pub key: &'static str,
    pub description: &'static str,
    pub value: &'static str,
    /// When set, a missing key is logged with this hint and skipped.
    pub unsupported_warning: Option<&'static str>,
}

pub const IPV4_FORWARDING: Sysctl = Sysctl {
    key: "net/ipv4/conf/all/forwarding",
    description: "IPv4 forwarding",
    value: "1",
    unsupported_warning: None,
};

pub const IPV6_FORWARDING: Sysctl = Sysctl {
    key: "net/ipv6/conf/all/forwarding",
    description: "IPv6 forwarding",
    value: "1",
    unsupported_warning: None,
};

pub const ARP_ACCEPT_ALL: Sysctl = Sysctl {
    key: "net/ipv4/conf/all/arp_accept",
    description: "arp_accept on all interfaces",
    value: "1",
    unsupported_warning: None,
};

pub const ARP_ACCEPT_DEFAULT: Sysctl = Sysctl {
    key: "net/ipv4/conf/default/arp_accept",
    description: "arp_accept on new interfaces",
    value: "1",
    unsupported_warning: None,
};

pub const ACCEPT_UNTRACKED_NA_ALL: Sysctl = Sysctl {
    key: "net/ipv6/conf/all/accept_untracked_na",
    description: "accept_untracked_na on all interfaces",
    value: "1",
    unsupported_warning: Some(UNTRACKED_NA_WARNING),
};

pub const ACCEPT_UNTRACKED_NA_DEFAULT: Sysctl = Sysctl {
    key: "net/ipv6/conf/default/accept_untracked_na",
    description: "accept_untracked_na on new interfaces",
    value: "1",
    unsupported_warning: Some(UNTRACKED_NA_WARNING),
};

/// Everything the router namespace needs.
pub const ROUTER_SYSCTLS: [Sysctl; 6] = [
    IPV4_FORWARDING,
    IPV6_FORWARDING,
    ARP_ACCEPT_ALL,
    ARP_ACCEPT_DEFAULT,
    ACCEPT_UNTRACKED_NA_ALL,
    ACCEPT_UNTRACKED_NA_DEFAULT,
];

/// Converge `sysctls` in namespace `ns`.
pub fn ensure(ns: &NsPath, sysctls: &[Sysctl]) -> Result<()> {
    in_namespace_path(ns, || ensure_at(Path::new(PROC_SYS), sysctls))
}

pub fn ensure_router_sysctls(ns: &NsPath) -> Result<()> {
    ensure(ns, &ROUTER_SYSCTLS)
}

pub fn ensure_ipv6_forwarding(ns: &NsPath) -> Result<()> {
    ensure(ns, &[IPV6_FORWARDING])
}

pub fn ensure_arp_accept(ns: &NsPath) -> Result<()> {
    ensure(ns, &[ARP_ACCEPT_ALL, ARP_ACCEPT_DEFAULT])
}

/// Converge `sysctls` below `root`, in the calling thread's namespace.
pub fn ensure_at(root: &Path, sysctls: &[Sysctl]) -> Result<()> {
    for sysctl in sysctls {
        match write_if_different(root, sysctl.key, sysctl.value) {
            Ok(true) => info!(
                key = sysctl.key,
                description = sysctl.description,
                "sysctl enabled"
            ),
            Ok(false) => {}
            Err(Error::Sysctl { source, .. })
                if source.kind() == io::ErrorKind::NotFound
                    && sysctl.unsupported_warning.is_some() =>
            {
                warn!(
                    key = sysctl.key,
                    description = sysctl.description,
                    hint = sysctl.unsupported_warning.unwrap_or_default(),
                    "skipping unsupported sysctl"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write `value` to `root/key` unless it already holds it.
///
/// Returns whether a write happened.
pub fn write_if_different(root: &Path, key: &str, value: &str) -> Result<bool> {
    let path = root.join(key);
    let sysctl_err = |source: io::Error| Error::Sysctl {
        key: key.to_string(),
        source,
    };

    let current = fs::read_to_string(&path).map_err(sysctl_err)?;
    if current.trim() == value {
        debug!(key, value, "sysctl already set");
        return Ok(false);
    }

    fs::write(&path, value).map_err(sysctl_err)?;
    Ok(true)
}

/// Sysctl key of a per-interface IPv6 setting.
pub fn ipv6_conf_key(iface: &str, setting: &str) -> String {
    format!("net/ipv6/conf/{iface}/{setting}")
}
