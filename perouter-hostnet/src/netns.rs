//! Network namespace handles and the namespace executor.
//!
//! Namespace membership belongs to a thread, not to the process. Every
//! switch therefore happens on a dedicated scoped thread: the caller's
//! thread (usually a tokio worker) never changes namespace, and the worker
//! thread is restored before it is joined.

use crate::error::{Error, Result};
use nix::sched::{CloneFlags, setns};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{error, trace};

/// Directory where `ip netns` bind-mounts named namespaces.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Namespace of the calling thread.
const THREAD_SELF_NETNS: &str = "/proc/thread-self/ns/net";

/// Identifies a network namespace by path.
///
/// A bare name (`perouter`) resolves to `/var/run/netns/perouter`; anything
/// containing a `/` (`/proc/1234/ns/net`) is taken as a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NsPath(PathBuf);

impl NsPath {
    pub fn new(id: &str) -> Self {
        if id.contains('/') {
            Self(PathBuf::from(id))
        } else {
            Self(Path::new(NETNS_RUN_DIR).join(id))
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Open the namespace file.
    pub fn open(&self) -> Result<NetNs> {
        NetNs::open(&self.0)
    }
}

impl From<String> for NsPath {
    fn from(id: String) -> Self {
        Self::new(&id)
    }
}

impl From<&str> for NsPath {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<NsPath> for String {
    fn from(ns: NsPath) -> Self {
        ns.0.to_string_lossy().into_owned()
    }
}

impl fmt::Display for NsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// An open network namespace.
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    fd: OwnedFd,
}

impl NetNs {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::Namespace {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            fd: file.into(),
        })
    }

    /// Open a namespace created by `ip netns add <name>`.
    pub fn from_name(name: &str) -> Result<Self> {
        Self::open(&Path::new(NETNS_RUN_DIR).join(name))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path.as_ref())
    }

    /// The namespace the calling thread is in right now.
    pub fn current_thread() -> Result<Self> {
        Self::open(Path::new(THREAD_SELF_NETNS))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn enter(&self) -> Result<()> {
        setns(&self.fd, CloneFlags::CLONE_NEWNET).map_err(|e| Error::Namespace {
            path: self.path.clone(),
            source: io::Error::from(e),
        })
    }
}

impl AsFd for NetNs {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for NetNs {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Run `f` with the network namespace switched to `ns`.
///
/// `f` runs on its own OS thread which enters `ns`, runs `f`, and switches
/// back to its original namespace on every exit path. A failure to switch
/// back is joined with `f`'s error. A panic in `f` resumes on the caller's
/// thread after the restore.
pub fn in_namespace<F, T>(ns: &NetNs, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    std::thread::scope(|scope| {
        let worker = std::thread::Builder::new()
            .name("netns".to_string())
            .spawn_scoped(scope, || run_switched(ns, f))?;

        match worker.join() {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    })
}

/// Open `ns` and run `f` inside it.
pub fn in_namespace_path<F, T>(ns: &NsPath, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    let handle = ns.open()?;
    in_namespace(&handle, f)
}

fn run_switched<F, T>(ns: &NetNs, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let original = NetNs::current_thread()?;
    ns.enter()?;
    trace!(netns = %ns.path.display(), "entered network namespace");

    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    let restored = original.enter();

    match outcome {
        Ok(result) => merge(result, restored),
        Err(payload) => {
            if let Err(e) = restored {
                error!(error = %e, "failed to restore network namespace after panic");
            }
            panic::resume_unwind(payload)
        }
    }
}

fn merge<T>(result: Result<T>, restored: Result<()>) -> Result<T> {
    match (result, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(restore)) => Err(restore),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore)) => Err(Error::Multiple(vec![e, restore])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_resolves_under_run_dir() {
        let ns = NsPath::new("perouter");
        assert_eq!(ns.as_path(), Path::new("/var/run/netns/perouter"));
        assert_eq!(ns.to_string(), "/var/run/netns/perouter");
    }

    #[test]
    fn test_path_is_kept() {
        let ns = NsPath::from("/proc/42/ns/net");
        assert_eq!(ns.as_path(), Path::new("/proc/42/ns/net"));
    }

    #[test]
    fn test_ns_path_serde() {
        let ns: NsPath = serde_json::from_str("\"router\"").unwrap();
        assert_eq!(ns, NsPath::new("router"));
        assert_eq!(
            serde_json::to_string(&ns).unwrap(),
            "\"/var/run/netns/router\""
        );
    }

    #[test]
    fn test_current_thread_fd() {
        let ns = NetNs::current_thread().unwrap();
        assert!(ns.as_raw_fd() >= 0);
        assert_eq!(ns.as_raw_fd(), ns.as_fd().as_raw_fd());
        assert_eq!(ns.path(), Path::new(THREAD_SELF_NETNS));
    }

    #[test]
    fn test_open_missing_namespace() {
        let err = NsPath::new("does-not-exist-ns").open().unwrap_err();
        assert!(matches!(err, Error::Namespace { .. }));
    }

    #[test]
    fn test_merge_keeps_both_errors() {
        let merged = merge::<()>(
            Err(Error::LinkNotFound("a".into())),
            Err(Error::InvalidParams("restore".into())),
        );
        assert!(matches!(merged, Err(Error::Multiple(ref v)) if v.len() == 2));
        assert!(merge(Ok(1), Ok(())).is_ok());
    }

    #[test]
    #[ignore = "requires CAP_SYS_ADMIN"]
    fn test_in_namespace_runs_on_other_thread() {
        let ns = NetNs::current_thread().unwrap();
        let caller = std::thread::current().id();
        let worker = in_namespace(&ns, || Ok(std::thread::current().id())).unwrap();
        assert_ne!(caller, worker);
    }

    #[test]
    #[ignore = "requires CAP_SYS_ADMIN"]
    fn test_in_namespace_propagates_error() {
        let ns = NetNs::current_thread().unwrap();
        let result: Result<()> = in_namespace(&ns, || Err(Error::LinkNotFound("x".into())));
        assert!(matches!(result, Err(Error::LinkNotFound(_))));
    }
}
