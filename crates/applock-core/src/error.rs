use std::path::PathBuf;

/// Failure taxonomy shared by the vault, the monitor and the file-protection
/// stack. Service code converts these into user-facing messages at the edge;
/// nothing in this list is ever swallowed silently except `ProcessRaceLost`,
/// which is logged and absorbed by the monitor.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("vault already initialized at {0}")]
    AlreadyInitialized(PathBuf),
    #[error("another monitor instance is already running")]
    AlreadyRunning,
    #[error("no privilege elevation mechanism is available")]
    ElevationUnavailable,
    #[error("privilege elevation denied: {0}")]
    ElevationDenied(String),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("invalid credential")]
    InvalidCredential,
    #[error("invalid recovery code")]
    InvalidCode,
    #[error("process exited before verification completed")]
    ProcessRaceLost,
    #[error("file operation failed on {path}: {reason}")]
    FileOperationFailed { path: PathBuf, reason: String },
}

impl LockError {
    pub fn file_op(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::FileOperationFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
