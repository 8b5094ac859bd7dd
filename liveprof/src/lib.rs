//! An HTTP endpoint for profiling the process it runs in.
//!
//! [`SessionController`] drives a [`ProfilerCapability`] through its
//! sampling lifecycle, [`ArtifactWriter`] turns the samples into a pprof or
//! JSON artifact, and [`EndpointRouter`] maps requests onto both. Use
//! [`serve`] to run the whole thing on a socket.
//!
//! [`ProfilerCapability`]: liveprof_capture::ProfilerCapability

pub mod artifact;
pub mod cli;
pub mod error;
pub mod params;
pub mod pool;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod stage;

pub use artifact::{Artifact, ArtifactName, ArtifactWriter, Destination, ProfileFormat};
pub use error::{ErrorCategory, ServerError, SessionError};
pub use params::{ParamError, Params};
pub use pool::WorkerPool;
pub use router::{EndpointRouter, Operation};
pub use server::{serve, serve_until, ServerConfig};
pub use session::{SessionController, SessionState};
pub use stage::StageRoot;

pub use liveprof_capture;
