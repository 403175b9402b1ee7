//! Pod mover error abstractions.

use std::time::Duration;

use thiserror::Error;

/// Process exit code for a startup failure.
pub const EXIT_STARTUP: i32 = 1;
/// Process exit code for a failed move which did not mutate the cluster.
pub const EXIT_UNTOUCHED: i32 = 2;
/// Process exit code for a failed move after which the cluster was restored.
pub const EXIT_RESTORED: i32 = 3;
/// Process exit code for a failed move which also failed to restore the cluster.
pub const EXIT_DEGRADED: i32 = 4;
/// Process exit code for a completed move which failed its health check.
pub const EXIT_UNHEALTHY: i32 = 5;

/// Typed failure conditions of a move.
#[derive(Debug, Error)]
pub enum MoveError {
    /// The pod is already running on the destination node.
    #[error("pod {pod} is already on node {node}")]
    AlreadyOnNode { pod: String, node: String },
    /// The pod's owner is of a kind whose scheduler can not be managed.
    #[error("unsupported parent {name} of kind {kind}")]
    UnsupportedKind { kind: String, name: String },
    /// The pod's legacy `created-by` annotation could not be decoded.
    #[error("failed to decode parent annotation of pod {pod}: {reason}")]
    InvalidParentAnnotation { pod: String, reason: String },
    /// Another move holds the lock of the pod's parent controller.
    #[error("timeout after {waited:?} acquiring lock {key}")]
    LockTimeout { key: String, waited: Duration },
    /// The lock of the parent controller expired while it was in use.
    #[error("lock {key} is no longer held")]
    LeaseLost { key: String },
    /// The parent controller's scheduler could not be confirmed as invalidated.
    #[error("failed to confirm scheduler of {controller} was set to {expected}")]
    InvalidationUnverified { controller: String, expected: String },
    /// The pod did not come up as expected after being moved.
    #[error("pod {pod} failed health check: {reason}")]
    Unhealthy { pod: String, reason: String },
}

/// The state in which a failed move left the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Disposition {
    /// No mutation was made to the cluster.
    Untouched,
    /// The cluster was mutated, and placement was restored afterwards.
    Restored,
    /// The cluster was mutated, and could not be restored.
    Degraded,
}

impl Disposition {
    /// The process exit code corresponding to this disposition.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Untouched => EXIT_UNTOUCHED,
            Self::Restored => EXIT_RESTORED,
            Self::Degraded => EXIT_DEGRADED,
        }
    }
}

/// A failed move along with the state it left the cluster in.
#[derive(Debug, Error)]
#[error("{error:#}")]
pub struct MoveFailure {
    pub disposition: Disposition,
    pub error: anyhow::Error,
}

impl MoveFailure {
    pub fn new(disposition: Disposition, error: anyhow::Error) -> Self {
        Self { disposition, error }
    }

    /// Get the typed cause of this failure, if any.
    pub fn cause(&self) -> Option<&MoveError> {
        self.error.downcast_ref::<MoveError>()
    }
}

/// A result type where the error is a `MoveFailure`.
pub type MoveResult<T> = ::std::result::Result<T, MoveFailure>;
