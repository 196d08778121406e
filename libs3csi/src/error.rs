//! CSI error types.
//!
//! All errors in the `libs3csi` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.
//!
//! Every variant maps to a stable [`StatusCode`] so callers on the other side
//! of the transport can decide whether to retry without parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied a missing or malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced bucket or volume does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another operation on the same volume is still in flight.
    #[error("an operation on volume {0} is already in progress")]
    Aborted(String),

    /// The object store could not be reached.
    #[error("object store unavailable: {0}")]
    StoreUnavailable(String),

    /// The object store rejected or failed an operation.
    #[error("object store operation failed: {0}")]
    StoreOperationFailed(String),

    /// Some objects survived deletion; the bucket was left in place.
    #[error("failed to remove {failed} objects out of total {total} under {path}")]
    PartialDeletionFailure {
        /// Objects that could not be removed.
        failed: u64,
        /// Objects that were attempted.
        total: u64,
        /// Bucket or `bucket/prefix` being emptied.
        path: String,
    },

    /// The mount did not become visible within the allotted time.
    #[error("mount at {path} did not appear within {seconds}s")]
    MountTimeout {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Timeout that elapsed.
        seconds: u64,
    },

    /// The external mount program or the bind-mount call failed.
    #[error("mount failed at {path}: {reason}")]
    MountExecutionFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The operation is intentionally not implemented by this plugin.
    #[error("{operation} is not supported")]
    Unsupported {
        /// Name of the CSI operation.
        operation: String,
    },

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable outcome classes a transport can map to its own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    Aborted,
    Unavailable,
    DeadlineExceeded,
    Unimplemented,
    Internal,
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Shorthand for [`CsiError::Unsupported`].
    pub fn unsupported(operation: &str) -> Self {
        Self::Unsupported {
            operation: operation.to_owned(),
        }
    }

    /// The outcome class reported to the orchestrator.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::NotFound(_) => StatusCode::NotFound,
            Self::Aborted(_) => StatusCode::Aborted,
            Self::StoreUnavailable(_) | Self::TransportError(_) => StatusCode::Unavailable,
            Self::MountTimeout { .. } => StatusCode::DeadlineExceeded,
            Self::Unsupported { .. } => StatusCode::Unimplemented,
            Self::StoreOperationFailed(_)
            | Self::PartialDeletionFailure { .. }
            | Self::MountExecutionFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::Internal(_) => StatusCode::Internal,
        }
    }
}
