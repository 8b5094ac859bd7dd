use std::net::SocketAddr;

use liveprof_capture::{CaptureError, ProfileKind};
use thiserror::Error;

use crate::params::ParamError;

/// The broad classes of failure, each with its own transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    ClientParameter,
    UnsupportedCapability,
    Filesystem,
    InternalCapture,
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// The query string was empty; carries the usage text.
    #[error("{1}")]
    MissingParameters(ProfileKind, String),

    #[error(transparent)]
    InvalidParameter(#[from] ParamError),

    #[error("{} profiling is not supported by this build. {}", .0.display_name(), .0.requirement())]
    Unsupported(ProfileKind),

    #[error("Subdirectory does not exist: {0}")]
    MissingSubdirectory(String),

    #[error("Unknown profile_type: {0}")]
    UnknownProfileType(String),

    #[error("Invalid debug_engine request: {0}")]
    InvalidBody(String),

    #[error("{} profiles do not support this operation", .0.display_name())]
    UnsupportedOperation(ProfileKind),

    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Capture(CaptureError),

    #[error("Background job failed: {0}")]
    Worker(String),
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Unsupported(kind) => SessionError::Unsupported(kind),
            err => SessionError::Capture(err),
        }
    }
}

impl SessionError {
    pub fn filesystem(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> SessionError {
        let context = context.into();
        move |source| SessionError::Filesystem { context, source }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::MissingParameters(..)
            | SessionError::InvalidParameter(_)
            | SessionError::UnknownProfileType(_)
            | SessionError::InvalidBody(_) => ErrorCategory::ClientParameter,
            SessionError::Unsupported(_) => ErrorCategory::UnsupportedCapability,
            SessionError::MissingSubdirectory(_) | SessionError::Filesystem { .. } => {
                ErrorCategory::Filesystem
            }
            SessionError::Capture(CaptureError::Io(..)) => ErrorCategory::Filesystem,
            SessionError::Capture(_) | SessionError::UnsupportedOperation(_) | SessionError::Worker(_) => {
                ErrorCategory::InternalCapture
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Could not bind to {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    #[error("Could not set up the stage directory {0}: {1}")]
    Stage(String, #[source] std::io::Error),

    #[error("Server error: {0}")]
    Accept(#[source] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unsupported_capture_errors_keep_their_category() {
        let err = SessionError::from(CaptureError::Unsupported(ProfileKind::HeapSnapshot));
        assert!(matches!(err, SessionError::Unsupported(ProfileKind::HeapSnapshot)));
        assert_eq!(err.category(), ErrorCategory::UnsupportedCapability);
        assert!(err.to_string().starts_with("Heap snapshot profiling is not supported"));

        let err = SessionError::from(CaptureError::StartFailed(
            liveprof_capture::Sampler::Cpu,
            "no timer".into(),
        ));
        assert_eq!(err.category(), ErrorCategory::InternalCapture);
    }

    #[test]
    fn client_errors() {
        assert_eq!(
            SessionError::UnknownProfileType("gpu".into()).to_string(),
            "Unknown profile_type: gpu"
        );
        assert_eq!(
            SessionError::MissingSubdirectory("a/b".into()).to_string(),
            "Subdirectory does not exist: a/b"
        );
        assert_eq!(
            SessionError::MissingSubdirectory("a".into()).category(),
            ErrorCategory::Filesystem
        );
    }
}
