//! Error type shared by every reconciliation entry point.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// eBPF manager errors.
#[derive(Debug, Error)]
pub enum BpfError {
    #[error("Failed to load eBPF object {path}: {source}")]
    Load {
        path: PathBuf,
        source: aya::EbpfError,
    },

    #[error("eBPF program error: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[error("Failed to access map: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    #[error("Map not found: {0}")]
    MapNotFound(String),

    #[error("Failed to attach {program} to {iface}: tcx: {tcx}; netlink: {netlink}")]
    Attach {
        program: String,
        iface: String,
        tcx: String,
        netlink: String,
    },
}

/// Host network errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A different interface already serves as underlay in the namespace.
    /// The namespace has to be torn down and rebuilt.
    #[error("existing underlay interface found: {current}, new is {requested}")]
    UnderlayExists { current: String, requested: String },

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("namespace {path}: {source}")]
    Namespace { path: PathBuf, source: io::Error },

    #[error("netlink {op} failed: {source}")]
    Netlink { op: String, source: rtnetlink::Error },

    #[error("ipam: {0}")]
    Ipam(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("eBPF: {0}")]
    Bpf(#[from] BpfError),

    #[error("ovs-vsctl {args}: {reason}")]
    Ovs { args: String, reason: String },

    #[error("{command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("sysctl {key}: {source}")]
    Sysctl { key: String, source: io::Error },

    #[error("shared underlay BPF manager not initialized")]
    SharedUnderlayNotInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid desired state: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn netlink(op: impl Into<String>, source: rtnetlink::Error) -> Self {
        Error::Netlink {
            op: op.into(),
            source,
        }
    }

    /// Collapse collected errors: none is success, one is returned as is.
    pub fn join(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    /// True if this error, or any joined error, is an underlay conflict.
    pub fn is_underlay_exists(&self) -> bool {
        match self {
            Error::UnderlayExists { .. } => true,
            Error::Multiple(errors) => errors.iter().any(Error::is_underlay_exists),
            _ => false,
        }
    }

    /// True for "object absent" conditions, which callers treat as retryable.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::LinkNotFound(_))
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_empty_is_ok() {
        assert!(Error::join(vec![]).is_ok());
    }

    #[test]
    fn test_join_single_is_unwrapped() {
        let err = Error::join(vec![Error::LinkNotFound("vni100".into())]).unwrap_err();
        assert!(matches!(err, Error::LinkNotFound(ref name) if name == "vni100"));
    }

    #[test]
    fn test_join_multiple_message() {
        let err = Error::join(vec![
            Error::LinkNotFound("a".into()),
            Error::InvalidParams("b".into()),
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "link a not found; invalid parameters: b");
    }

    #[test]
    fn test_underlay_exists_detected_inside_join() {
        let err = Error::Multiple(vec![
            Error::InvalidParams("x".into()),
            Error::UnderlayExists {
                current: "eth1".into(),
                requested: "eth2".into(),
            },
        ]);
        assert!(err.is_underlay_exists());
        assert_eq!(
            Error::UnderlayExists {
                current: "eth1".into(),
                requested: "eth2".into(),
            }
            .to_string(),
            "existing underlay interface found: eth1, new is eth2"
        );
    }
}
