//! eBPF traffic steering for the shared-NIC underlay.
//!
//! Two TC ingress classifiers split one physical NIC between the host and
//! the router namespace:
//!
//! ```text
//!   NIC --nic_ingress--> ul-host ==veth== ul-pe (router ns)
//!    ^                      |
//!    +--ul_host_ingress-----+
//! ```
//!
//! `nic_ingress` redirects ARP, BGP and BFD from known neighbours and VXLAN
//! of known VNIs to `ul-host`; everything else stays on the host.
//! `ul_host_ingress` sends whatever the router emits out of the NIC.

use crate::error::{BpfError, Result};
use aya::maps::{Array, HashMap, MapData};
use aya::programs::tc::{NlOptions, SchedClassifierLinkId, TcAttachOptions};
use aya::programs::{LinkOrder, SchedClassifier, TcAttachType, tc};
use aya::{Ebpf, EbpfLoader, Pod};
use std::borrow::BorrowMut;
use std::collections::HashSet;
use std::ffi::CStr;
use std::hash::Hash;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const NIC_INGRESS_PROGRAM: &str = "nic_ingress";
pub const UL_HOST_INGRESS_PROGRAM: &str = "ul_host_ingress";

pub const NEIGHBOR_MAP: &str = "NEIGHBOR_MAP";
pub const VNI_MAP: &str = "VNI_MAP";
pub const CONFIG_MAP: &str = "CONFIG_MAP";

pub const DEFAULT_NIC_INGRESS_OBJECT: &str = "/usr/lib/perouter/ebpf/nic-ingress";
pub const DEFAULT_UL_HOST_INGRESS_OBJECT: &str = "/usr/lib/perouter/ebpf/ul-host-ingress";

/// Value stored for every present key.
const PRESENT: u8 = 1;

/// A BPF map used as a set.
pub trait KeySet<K> {
    fn current(&self) -> Result<Vec<K>>;
    fn add(&mut self, key: K) -> Result<()>;
    fn delete(&mut self, key: &K) -> Result<()>;
}

impl<T, K> KeySet<K> for HashMap<T, K, u8>
where
    T: BorrowMut<MapData>,
    K: Pod,
{
    fn current(&self) -> Result<Vec<K>> {
        let keys = self
            .keys()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(BpfError::from)?;
        Ok(keys)
    }

    fn add(&mut self, key: K) -> Result<()> {
        self.insert(key, PRESENT, 0).map_err(BpfError::from)?;
        Ok(())
    }

    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key).map_err(BpfError::from)?;
        Ok(())
    }
}

/// Make `set` hold exactly `desired`.
///
/// Stale keys are removed first, then missing keys added. Keys present in
/// both are never touched, so traffic matching them is never dropped
/// mid-update.
pub fn converge<K, S>(set: &mut S, desired: &HashSet<K>) -> Result<()>
where
    K: Eq + Hash + Copy,
    S: KeySet<K> + ?Sized,
{
    let current: HashSet<K> = set.current()?.into_iter().collect();
    for stale in current.difference(desired) {
        set.delete(stale)?;
    }
    for missing in desired.difference(&current) {
        set.add(*missing)?;
    }
    Ok(())
}

/// IPv4 neighbour keys of `ips`. Other families are skipped.
pub fn neighbor_keys(ips: &[IpAddr]) -> HashSet<[u8; 4]> {
    ips.iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4.octets()),
            IpAddr::V6(_) => None,
        })
        .collect()
}

/// Loaded and attached steering programs.
pub trait Steering: Send {
    /// Converge the neighbour set. Non-IPv4 entries are skipped.
    fn update_neighbors(&mut self, ips: &[IpAddr]) -> Result<()>;

    /// Converge the VNI set.
    fn update_vnis(&mut self, vnis: &[u32]) -> Result<()>;

    /// Detach the programs.
    fn close(&mut self) -> Result<()>;
}

/// Builds [`Steering`] for a NIC and its `ul-host` veth.
pub trait SteeringLoader: Send + Sync {
    fn load(&self, nic_index: u32, ul_host_index: u32) -> Result<Box<dyn Steering>>;
}

/// How a classifier ended up attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// TCX link, kernel 6.6 and newer.
    Tcx,
    /// clsact qdisc plus a netlink `cls_bpf` filter.
    Netlink,
}

/// One loaded object with its classifier attached to an interface.
struct AttachedProgram {
    ebpf: Ebpf,
    program: &'static str,
    iface: String,
    mode: AttachMode,
    link: Option<SchedClassifierLinkId>,
}

impl AttachedProgram {
    fn load(path: &Path, program: &'static str, peer_index: u32) -> Result<Self> {
        let mut ebpf = EbpfLoader::new()
            .load_file(path)
            .map_err(|source| BpfError::Load {
                path: path.to_path_buf(),
                source,
            })?;

        // The peer interface every redirect targets.
        let mut config: Array<_, u32> = ebpf
            .map_mut(CONFIG_MAP)
            .ok_or_else(|| BpfError::MapNotFound(CONFIG_MAP.to_string()))?
            .try_into()
            .map_err(BpfError::from)?;
        config.set(0, peer_index, 0).map_err(BpfError::from)?;

        let classifier: &mut SchedClassifier = ebpf
            .program_mut(program)
            .ok_or_else(|| BpfError::ProgramNotFound(program.to_string()))?
            .try_into()
            .map_err(BpfError::from)?;
        classifier.load().map_err(BpfError::from)?;

        debug!(program, path = %path.display(), "eBPF object loaded");
        Ok(Self {
            ebpf,
            program,
            iface: String::new(),
            mode: AttachMode::Tcx,
            link: None,
        })
    }

    /// Attach as an ingress classifier of `if_index`, TCX first.
    fn attach(&mut self, if_index: u32) -> Result<()> {
        let iface = interface_name(if_index)?;
        let classifier: &mut SchedClassifier = self
            .ebpf
            .program_mut(self.program)
            .ok_or_else(|| BpfError::ProgramNotFound(self.program.to_string()))?
            .try_into()
            .map_err(BpfError::from)?;

        let tcx = match classifier.attach_with_options(
            &iface,
            TcAttachType::Ingress,
            TcAttachOptions::TcxOrder(LinkOrder::default()),
        ) {
            Ok(link) => {
                self.finish_attach(iface, AttachMode::Tcx, link);
                return Ok(());
            }
            Err(e) => e,
        };
        info!(program = self.program, iface = %iface, error = %tcx, "TCX attach failed, falling back to netlink");

        // May exist already.
        if let Err(e) = tc::qdisc_add_clsact(&iface) {
            debug!(iface = %iface, error = %e, "clsact qdisc not added");
        }

        match classifier.attach_with_options(
            &iface,
            TcAttachType::Ingress,
            TcAttachOptions::Netlink(NlOptions::default()),
        ) {
            Ok(link) => {
                self.finish_attach(iface, AttachMode::Netlink, link);
                Ok(())
            }
            Err(netlink) => Err(BpfError::Attach {
                program: self.program.to_string(),
                iface,
                tcx: tcx.to_string(),
                netlink: netlink.to_string(),
            }
            .into()),
        }
    }

    fn finish_attach(&mut self, iface: String, mode: AttachMode, link: SchedClassifierLinkId) {
        info!(program = self.program, iface = %iface, ?mode, "eBPF program attached");
        self.iface = iface;
        self.mode = mode;
        self.link = Some(link);
    }

    fn detach(&mut self) -> Result<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        let classifier: &mut SchedClassifier = self
            .ebpf
            .program_mut(self.program)
            .ok_or_else(|| BpfError::ProgramNotFound(self.program.to_string()))?
            .try_into()
            .map_err(BpfError::from)?;
        classifier.detach(link).map_err(BpfError::from)?;
        info!(program = self.program, iface = %self.iface, mode = ?self.mode, "eBPF program detached");
        Ok(())
    }

    fn key_set<K: Pod>(&mut self, name: &str) -> Result<HashMap<&mut MapData, K, u8>> {
        let map = self
            .ebpf
            .map_mut(name)
            .ok_or_else(|| BpfError::MapNotFound(name.to_string()))?
            .try_into()
            .map_err(BpfError::from)?;
        Ok(map)
    }
}

/// aya-backed [`Steering`].
pub struct BpfManager {
    nic: AttachedProgram,
    ul_host: AttachedProgram,
}

impl BpfManager {
    /// Load both programs, point each at the other interface and attach
    /// them as ingress classifiers.
    pub fn new(objects: &SteeringObjects, nic_index: u32, ul_host_index: u32) -> Result<Self> {
        let mut nic = AttachedProgram::load(&objects.nic_ingress, NIC_INGRESS_PROGRAM, ul_host_index)?;
        let mut ul_host =
            AttachedProgram::load(&objects.ul_host_ingress, UL_HOST_INGRESS_PROGRAM, nic_index)?;

        nic.attach(nic_index)?;
        if let Err(e) = ul_host.attach(ul_host_index) {
            if let Err(detach) = nic.detach() {
                warn!(error = %detach, "failed to detach NIC program after attach failure");
            }
            return Err(e);
        }

        Ok(Self { nic, ul_host })
    }

    pub fn attach_modes(&self) -> (AttachMode, AttachMode) {
        (self.nic.mode, self.ul_host.mode)
    }
}

impl Steering for BpfManager {
    fn update_neighbors(&mut self, ips: &[IpAddr]) -> Result<()> {
        let desired = neighbor_keys(ips);
        let mut map = self.nic.key_set::<[u8; 4]>(NEIGHBOR_MAP)?;
        converge(&mut map, &desired)?;
        debug!(count = desired.len(), "neighbor map updated");
        Ok(())
    }

    fn update_vnis(&mut self, vnis: &[u32]) -> Result<()> {
        let desired: HashSet<u32> = vnis.iter().copied().collect();
        let mut map = self.nic.key_set::<u32>(VNI_MAP)?;
        converge(&mut map, &desired)?;
        debug!(count = desired.len(), "vni map updated");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let nic = self.nic.detach();
        let ul_host = self.ul_host.detach();
        crate::error::Error::join([nic.err(), ul_host.err()].into_iter().flatten().collect())
    }
}

/// Locations of the compiled steering objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteeringObjects {
    pub nic_ingress: PathBuf,
    pub ul_host_ingress: PathBuf,
}

impl Default for SteeringObjects {
    fn default() -> Self {
        Self {
            nic_ingress: PathBuf::from(DEFAULT_NIC_INGRESS_OBJECT),
            ul_host_ingress: PathBuf::from(DEFAULT_UL_HOST_INGRESS_OBJECT),
        }
    }
}

impl SteeringObjects {
    /// Objects named `nic-ingress` and `ul-host-ingress` below `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            nic_ingress: dir.join("nic-ingress"),
            ul_host_ingress: dir.join("ul-host-ingress"),
        }
    }
}

/// Loads [`BpfManager`]s from object files.
#[derive(Debug, Clone, Default)]
pub struct BpfSteeringLoader {
    objects: SteeringObjects,
}

impl BpfSteeringLoader {
    pub fn new(objects: SteeringObjects) -> Self {
        Self { objects }
    }
}

impl SteeringLoader for BpfSteeringLoader {
    fn load(&self, nic_index: u32, ul_host_index: u32) -> Result<Box<dyn Steering>> {
        Ok(Box::new(BpfManager::new(
            &self.objects,
            nic_index,
            ul_host_index,
        )?))
    }
}

/// Interface name of `if_index` in the calling thread's namespace.
fn interface_name(if_index: u32) -> Result<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(if_index, buf.as_mut_ptr()) };
    if ret.is_null() {
        return Err(io::Error::last_os_error().into());
    }
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}
