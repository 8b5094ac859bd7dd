use std::path::PathBuf;

use thiserror::Error;

use crate::kind::{ProfileKind, Sampler};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("{} profiling is not supported by this build. {}", .0.display_name(), .0.requirement())]
    Unsupported(ProfileKind),

    #[error("The {0} sampler was given a configuration for the {1} sampler")]
    MismatchedConfig(Sampler, Sampler),

    #[error("The {0} sampler could not be started: {1}")]
    StartFailed(Sampler, String),

    #[error("Building the {0} report failed: {1}")]
    ReportFailed(Sampler, String),

    #[error("I/O error while writing {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Could not serialize {0}: {1}")]
    Serialization(&'static str, #[source] serde_json::Error),

    #[error("Could not encode the pprof profile: {0}")]
    PprofEncode(#[source] prost::EncodeError),

    #[error("Could not decode the pprof profile: {0}")]
    PprofDecode(#[source] prost::DecodeError),

    #[error("Could not decompress the pprof profile: {0}")]
    Gzip(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

impl CaptureError {
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> CaptureError {
        let path = path.into();
        move |e| CaptureError::Io(path, e)
    }
}
