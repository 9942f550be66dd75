//! Error taxonomy shared by the engine and the task plug-ins.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Structural problems reported by [`crate::TaskGraph::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("cycle detected through `{0}`")]
    CycleDetected(String),
    #[error("`{node}` declares {expected} inputs but {connected} are connected")]
    ArityMismatch {
        node: String,
        expected: usize,
        connected: usize,
    },
    #[error("`{src}` produces {got}-dimensional data but port {port} of `{dst}` expects {expected} dimensions")]
    DimensionMismatch {
        src: String,
        dst: String,
        port: usize,
        expected: usize,
        got: usize,
    },
    #[error("graph is frozen and can no longer be modified")]
    Frozen,
}

/// Faults surfaced by the scheduler. The first fault of a run wins; every
/// later one is dropped on the floor by the set-once slot.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid graph: {0}")]
    GraphInvalid(#[from] GraphError),
    #[error("setup failed: {0}")]
    SetupFailed(String),
    #[error("i/o failed: {0}")]
    IoFailed(String),
    #[error("host/device transfer failed: {0}")]
    DeviceTransferFailed(String),
    #[error("kernel launch failed: {0}")]
    KernelLaunchFailed(String),
    #[error("invalid value for option `{option}`: {reason}")]
    ConfigInvalid { option: String, reason: String },
    #[error("cancelled")]
    Cancelled,
    /// A fault tagged with the node it came from.
    #[error("`{node}`: {source}")]
    Node {
        node: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn in_node(self, node: &str) -> Error {
        match self {
            // Keep the innermost node attribution.
            Error::Node { .. } => self,
            other => Error::Node {
                node: node.to_owned(),
                source: Box::new(other),
            },
        }
    }

    /// True for [`Error::Cancelled`], also when wrapped in a node context.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Node { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
