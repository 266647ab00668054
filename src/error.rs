//! Caller-visible error taxonomy of the platform service.
//!
//! Internal plumbing uses `anyhow::Result`; only the service boundary
//! converts into [`ServiceError`], which is serializable so it can travel
//! over the RPC transport unchanged.

use serde::{Deserialize, Serialize};

/// Which allow-list a denied request was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Signal,
    Control,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessKind::Signal => write!(f, "signal"),
            AccessKind::Control => write!(f, "control"),
        }
    }
}

/// Errors returned by platform service operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceError {
    /// The operation requires a session the client does not have.
    SessionMissing { pid: u32, operation: String },
    /// Requested names are outside the session allow-list.
    AccessDenied { kind: AccessKind, names: Vec<String> },
    /// Another client holds the write lock.
    WriteBusy { owner: u32 },
    /// An administrator has blocked write mode system wide.
    ControlLocked,
    /// Administrative operation requested by a caller other than root.
    NotPermitted { operation: String },
    /// Malformed group, unknown user, nested lock, batch server overwrite.
    ArgumentInvalid { message: String },
    /// Propagated from the hardware I/O collaborator.
    Hardware { message: String },
    /// Unexpected filesystem or runtime failure.
    Internal { message: String },
}

/// Result type for platform service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ServiceError::ArgumentInvalid {
            message: message.into(),
        }
    }

    pub fn hardware(err: anyhow::Error) -> Self {
        ServiceError::Hardware {
            message: format!("{:#}", err),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        ServiceError::Internal {
            message: format!("{:#}", err),
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::SessionMissing { pid, operation } => write!(
                f,
                "Operation {} not allowed without an open session. Client PID: {}",
                operation, pid
            ),
            ServiceError::AccessDenied { kind, names } => write!(
                f,
                "Requested {}s that are not allowed: {}",
                kind,
                names.join(", ")
            ),
            ServiceError::WriteBusy { owner } => write!(
                f,
                "The geopm service already has write mode client with PID or SID of {}",
                owner
            ),
            ServiceError::ControlLocked => {
                write!(f, "Write mode is locked by the administrator")
            }
            ServiceError::NotPermitted { operation } => {
                write!(f, "Operation {} requires root privileges", operation)
            }
            ServiceError::ArgumentInvalid { message } => write!(f, "Invalid argument: {}", message),
            ServiceError::Hardware { message } => write!(f, "Platform I/O error: {}", message),
            ServiceError::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for ServiceError {}
