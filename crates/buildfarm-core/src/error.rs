//! Error types for the build farm.

use thiserror::Error;

use crate::job::BuildStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot build: {0}")]
    CannotBuild(String),

    #[error("no image available for {series}/{arch} (wanted one of: {wanted})")]
    NoImageAvailable {
        series: String,
        arch: String,
        wanted: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected worker status: {0}")]
    UnexpectedWorkerStatus(String),

    #[error("worker returned a file named {0:?} outside the staging root")]
    PathEscape(String),

    #[error("worker returned conflicting output paths for {0:?}")]
    ConflictingOutput(String),

    #[error("invalid build cookie: {0:?}")]
    InvalidCookie(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: BuildStatus, to: BuildStatus },

    #[error("stale status for {job}: expected {expected}, found {found}")]
    StaleStatus {
        job: String,
        expected: BuildStatus,
        found: BuildStatus,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the worker broke the build protocol.
    ///
    /// Protocol violations force the job into a failure status instead of
    /// leaving it for the scheduler to retry.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::UnexpectedWorkerStatus(_)
                | Error::PathEscape(_)
                | Error::ConflictingOutput(_)
                | Error::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violations() {
        assert!(Error::PathEscape("../evil".into()).is_protocol_violation());
        assert!(Error::UnexpectedWorkerStatus("GIVENBACK".into()).is_protocol_violation());
        assert!(Error::ConflictingOutput("x.deb".into()).is_protocol_violation());
        assert!(!Error::Transport("connection refused".into()).is_protocol_violation());
        assert!(!Error::CannotBuild("no chroot".into()).is_protocol_violation());
    }
}
