use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{header, Response, StatusCode};

use crate::artifact::Artifact;
use crate::error::{ErrorCategory, SessionError};

pub type ResponseBody = Full<Bytes>;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

fn text_response(status: StatusCode, text: String) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from(text)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(TEXT_PLAIN),
    );
    response
}

/// 200 with the artifact, either as an attachment or as the file's path.
pub fn artifact_response(artifact: Artifact) -> Response<ResponseBody> {
    match artifact {
        Artifact::Inline {
            content_type,
            filename,
            bytes,
        } => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static(content_type),
            );
            // The filename is built from ASCII parameter text, but fall back
            // to a bare attachment rather than failing the response.
            let disposition =
                header::HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
                    .unwrap_or_else(|_| header::HeaderValue::from_static("attachment"));
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, disposition);
            response
        }
        Artifact::File(path) => text_response(StatusCode::OK, path.display().to_string()),
    }
}

/// 200 with a short acknowledgement.
pub fn text_ok(text: String) -> Response<ResponseBody> {
    text_response(StatusCode::OK, text)
}

pub fn status_for(err: &SessionError) -> StatusCode {
    match err.category() {
        ErrorCategory::ClientParameter => StatusCode::BAD_REQUEST,
        ErrorCategory::UnsupportedCapability => StatusCode::NOT_IMPLEMENTED,
        ErrorCategory::Filesystem => match err {
            SessionError::MissingSubdirectory(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        ErrorCategory::InternalCapture => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: &SessionError) -> Response<ResponseBody> {
    let status = status_for(err);
    if status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED {
        log::error!("{err}");
    } else {
        log::debug!("Rejected request ({status}): {err}");
    }
    text_response(status, format!("{err}\n"))
}

pub fn not_found(path: &str) -> Response<ResponseBody> {
    text_response(StatusCode::NOT_FOUND, format!("No endpoint at {path}\n"))
}

pub fn method_not_allowed(allow: &'static str) -> Response<ResponseBody> {
    let mut response = text_response(
        StatusCode::METHOD_NOT_ALLOWED,
        format!("Use {allow} for this endpoint\n"),
    );
    response
        .headers_mut()
        .insert(header::ALLOW, header::HeaderValue::from_static(allow));
    response
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use liveprof_capture::{CaptureError, ProfileKind, Sampler};

    use super::*;
    use crate::params::ParamError;

    #[test]
    fn statuses() {
        let cases = [
            (SessionError::MissingParameters(ProfileKind::Cpu, "usage".into()), 400),
            (
                SessionError::InvalidParameter(ParamError::NotAScalar {
                    name: "n".into(),
                    value: "[]".into(),
                }),
                400,
            ),
            (SessionError::Unsupported(ProfileKind::Allocations), 501),
            (SessionError::MissingSubdirectory("x".into()), 400),
            (SessionError::UnknownProfileType("x".into()), 400),
            (
                SessionError::Filesystem {
                    context: "write".into(),
                    source: std::io::Error::other("disk full"),
                },
                500,
            ),
            (
                SessionError::Capture(CaptureError::ReportFailed(Sampler::Cpu, "x".into())),
                500,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err).as_u16(), status, "{err}");
        }
    }

    #[test]
    fn inline_headers() {
        let response = artifact_response(Artifact::Inline {
            content_type: crate::artifact::OCTET_STREAM,
            filename: "cpu_profile.pb.gz".into(),
            bytes: vec![1, 2, 3],
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"cpu_profile.pb.gz\""
        );

        let response = artifact_response(Artifact::File(PathBuf::from("/tmp/a.json")));
        assert_eq!(response.headers()[header::CONTENT_TYPE], TEXT_PLAIN);
    }

    #[test]
    fn wrong_method() {
        let response = method_not_allowed("POST");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "POST");
    }
}
