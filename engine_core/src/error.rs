//! # Control Plane Errors
//!
//! Every public operation of the control plane reports failure through
//! `ControlError`. Lower-level I/O, HTTP and archive errors are caught at the
//! edge of each operation and converted to the closest kind below, with a
//! human-readable message attached.

use thiserror::Error;

/// Shorthand used throughout the crate.
pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug, Error)]
pub enum ControlError {
    /// A binary, config file or backup that the operation needs is missing.
    #[error("{0} not found")]
    NotFound(String),

    /// A start or stop is already running on this instance.
    #[error("{0} already in progress")]
    AlreadyInProgress(&'static str),

    /// The engine exited while it was expected to be running.
    #[error("engine crashed: {0}")]
    ProcessCrash(String),

    /// The release archive could not be fetched or the feed payload was malformed.
    #[error("download failed: {0}")]
    DownloadFailure(String),

    /// The release archive could not be unpacked.
    #[error("extraction failed: {0}")]
    ExtractFailure(String),

    /// The unpacked binary could not be put in place.
    #[error("installation failed: {0}")]
    InstallFailure(String),

    /// A readiness or graceful-stop deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Transport-level failure talking to the release feed or control API.
    #[error("network error: {0}")]
    Network(String),

    /// The host settings store rejected a read or write.
    #[error("settings store error: {0}")]
    Settings(String),

    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Wraps any displayable error as a `Network` failure.
    pub(crate) fn network(err: impl std::fmt::Display) -> Self {
        ControlError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_message() {
        let err = ControlError::NotFound("executable".into());
        assert_eq!(err.to_string(), "executable not found");
    }

    #[test]
    fn io_errors_convert() {
        let err: ControlError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, ControlError::Io(_)));
    }
}
