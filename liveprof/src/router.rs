use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Method, Request, Response};
use liveprof_capture::ProfileKind;
use serde_derive::Deserialize;
use serde_json::{Map, Value};

use crate::artifact::Destination;
use crate::error::SessionError;
use crate::params::{usage, Params};
use crate::response::{
    artifact_response, error_response, method_not_allowed, not_found, text_ok, ResponseBody,
};
use crate::session::SessionController;
use crate::stage::StageRoot;

pub const DEBUG_ENGINE_PATH: &str = "/debug_engine";

/// What a request asks the controller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    RunForDuration(ProfileKind),
    Start(ProfileKind),
    Stop(ProfileKind),
    OneShot(ProfileKind),
}

impl Operation {
    pub const ALL: [Operation; 11] = [
        Operation::RunForDuration(ProfileKind::Cpu),
        Operation::Start(ProfileKind::Cpu),
        Operation::Stop(ProfileKind::Cpu),
        Operation::RunForDuration(ProfileKind::Wall),
        Operation::Start(ProfileKind::Wall),
        Operation::Stop(ProfileKind::Wall),
        Operation::RunForDuration(ProfileKind::Allocations),
        Operation::Start(ProfileKind::Allocations),
        Operation::Stop(ProfileKind::Allocations),
        Operation::OneShot(ProfileKind::HeapSnapshot),
        Operation::OneShot(ProfileKind::TaskBacktraces),
    ];

    pub fn kind(self) -> ProfileKind {
        match self {
            Operation::RunForDuration(kind)
            | Operation::Start(kind)
            | Operation::Stop(kind)
            | Operation::OneShot(kind) => kind,
        }
    }

    /// The path-based route, or `None` for combinations no route exists for.
    pub fn path(self) -> Option<&'static str> {
        Some(match self {
            Operation::RunForDuration(ProfileKind::Cpu) => "/profile",
            Operation::Start(ProfileKind::Cpu) => "/profile_start",
            Operation::Stop(ProfileKind::Cpu) => "/profile_stop",
            Operation::RunForDuration(ProfileKind::Wall) => "/wall_profile",
            Operation::Start(ProfileKind::Wall) => "/wall_profile_start",
            Operation::Stop(ProfileKind::Wall) => "/wall_profile_stop",
            Operation::RunForDuration(ProfileKind::Allocations) => "/allocs_profile",
            Operation::Start(ProfileKind::Allocations) => "/allocs_profile_start",
            Operation::Stop(ProfileKind::Allocations) => "/allocs_profile_stop",
            Operation::OneShot(ProfileKind::HeapSnapshot) => "/heap_snapshot",
            Operation::OneShot(ProfileKind::TaskBacktraces) => "/task_backtraces",
            _ => return None,
        })
    }

    /// The `profile_type` value `debug_engine` accepts for this operation.
    pub fn profile_type(self) -> Option<&'static str> {
        Some(match self {
            Operation::RunForDuration(ProfileKind::Cpu) => "cpu_profile",
            Operation::Start(ProfileKind::Cpu) => "cpu_profile_start",
            Operation::Stop(ProfileKind::Cpu) => "cpu_profile_stop",
            Operation::RunForDuration(ProfileKind::Wall) => "wall_profile",
            Operation::Start(ProfileKind::Wall) => "wall_profile_start",
            Operation::Stop(ProfileKind::Wall) => "wall_profile_stop",
            Operation::RunForDuration(ProfileKind::Allocations) => "allocs_profile",
            Operation::Start(ProfileKind::Allocations) => "allocs_profile_start",
            Operation::Stop(ProfileKind::Allocations) => "allocs_profile_stop",
            Operation::OneShot(ProfileKind::HeapSnapshot) => "heap_snapshot",
            Operation::OneShot(ProfileKind::TaskBacktraces) => "task_backtraces",
            _ => return None,
        })
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.path() == Some(path))
    }

    pub fn from_profile_type(profile_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.profile_type() == Some(profile_type))
    }
}

#[derive(Debug, Deserialize)]
struct DebugEngineRequest {
    profile_type: String,
    #[serde(flatten)]
    params: Map<String, Value>,
}

/// Binds paths to controller operations and turns the outcome into a
/// response.
pub struct EndpointRouter {
    controller: Arc<SessionController>,
    stage: StageRoot,
}

impl EndpointRouter {
    pub fn new(controller: Arc<SessionController>, stage: StageRoot) -> Self {
        EndpointRouter { controller, stage }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn stage(&self) -> &StageRoot {
        &self.stage
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: Display,
    {
        let path = req.uri().path().to_string();
        log::debug!("{} {}", req.method(), req.uri());

        if path == DEBUG_ENGINE_PATH {
            if req.method() != Method::POST {
                return method_not_allowed("POST");
            }
            return match self.debug_engine(req).await {
                Ok(response) => response,
                Err(err) => error_response(&err),
            };
        }

        let Some(operation) = Operation::from_path(&path) else {
            return not_found(&path);
        };
        if req.method() != Method::GET {
            return method_not_allowed("GET");
        }
        let query = req.uri().query();
        let params = Params::from_query(query);
        let result = match operation {
            // Unsupported kinds answer 501 before any usage text.
            Operation::RunForDuration(kind) if params.is_empty() => {
                match self.controller.check_supported(kind) {
                    Ok(()) => Err(SessionError::MissingParameters(kind, usage(kind, &path))),
                    Err(err) => Err(err),
                }
            }
            _ => self.dispatch(operation, &params, &Destination::Inline).await,
        };
        result.unwrap_or_else(|err| error_response(&err))
    }

    async fn debug_engine<B>(&self, req: Request<B>) -> Result<Response<ResponseBody>, SessionError>
    where
        B: Body,
        B::Error: Display,
    {
        let subdir = Params::from_query(req.uri().query())
            .get("subdir")
            .map(str::to_string);
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| SessionError::InvalidBody(format!("could not read the body: {e}")))?
            .to_bytes();
        let request: DebugEngineRequest = serde_json::from_slice(&body).map_err(|e| {
            SessionError::InvalidBody(format!(
                "expected a JSON object with a `profile_type` member: {e}"
            ))
        })?;
        let operation = Operation::from_profile_type(&request.profile_type)
            .ok_or_else(|| SessionError::UnknownProfileType(request.profile_type.clone()))?;
        let dir: PathBuf = self.stage.resolve(subdir.as_deref())?;
        let params = Params::from_json(&request.params, &[])?;
        log::info!(
            "debug_engine: {} into {}",
            request.profile_type,
            dir.display()
        );
        self.dispatch(operation, &params, &Destination::Stage(dir))
            .await
    }

    async fn dispatch(
        &self,
        operation: Operation,
        params: &Params,
        destination: &Destination,
    ) -> Result<Response<ResponseBody>, SessionError> {
        let controller = &self.controller;
        let artifact = match operation {
            Operation::RunForDuration(kind) => {
                controller
                    .run_for_duration(kind, params, destination)
                    .await?
            }
            Operation::Start(kind) => return Ok(text_ok(controller.start(kind, params)?)),
            Operation::Stop(kind) => controller.stop(kind, params, destination).await?,
            Operation::OneShot(kind) => controller.one_shot(kind, params, destination).await?,
        };
        Ok(artifact_response(artifact))
    }
}
