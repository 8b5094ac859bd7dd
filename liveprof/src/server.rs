use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use liveprof_capture::ProfilerCapability;
use tokio::net::TcpListener;

use crate::error::ServerError;
use crate::pool::WorkerPool;
use crate::router::EndpointRouter;
use crate::session::SessionController;
use crate::stage::StageRoot;

pub const DEFAULT_PORT: u16 = 16825;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Where `debug_engine` writes artifacts. A temporary directory is
    /// created when this is `None` and removed when the server stops.
    pub stage_dir: Option<PathBuf>,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            stage_dir: None,
            workers: 2,
        }
    }
}

impl ServerConfig {
    pub fn build_router(
        &self,
        capability: Arc<dyn ProfilerCapability>,
    ) -> Result<EndpointRouter, ServerError> {
        let stage = StageRoot::new(self.stage_dir.as_deref()).map_err(|e| {
            let name = match &self.stage_dir {
                Some(dir) => dir.display().to_string(),
                None => "(temporary)".to_string(),
            };
            ServerError::Stage(name, e)
        })?;
        let controller = SessionController::new(capability, WorkerPool::new(self.workers));
        Ok(EndpointRouter::new(Arc::new(controller), stage))
    }
}

/// Binds `config.addr` and serves until Ctrl+C.
pub async fn serve(
    config: ServerConfig,
    capability: Arc<dyn ProfilerCapability>,
) -> Result<(), ServerError> {
    let router = Arc::new(config.build_router(capability)?);
    let listener = TcpListener::bind(config.addr)
        .await
        .map_err(|e| ServerError::Bind(config.addr, e))?;
    let local_addr = listener.local_addr().unwrap_or(config.addr);
    log::info!("Listening on http://{local_addr}");
    log::info!("debug_engine artifacts go to {}", router.stage().path().display());
    log::info!(
        "Supported profile kinds: {}",
        router.controller().supported_kinds()
    );

    serve_until(listener, router, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Could not listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// Accepts connections on `listener` until `shutdown` completes. Each
/// connection is served on its own task.
pub async fn serve_until(
    listener: TcpListener,
    router: Arc<EndpointRouter>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServerError> {
    let service = service_fn(move |req: Request<Incoming>| {
        let router = router.clone();
        async move { Ok::<_, Infallible>(router.handle(req).await) }
    });

    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();
    tokio::pin!(shutdown);
    loop {
        let conn = tokio::select! {
            () = &mut shutdown => {
                log::info!("Shutting down");
                break;
            }
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("Server error: {e}");
                    return Err(ServerError::Accept(e));
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    std::panic::resume_unwind(e.into_panic());
                },
                Ok(()) | Err(_) => continue,
            },
        };
        let conn = TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                log::error!("Connection error: {e}");
            }
        });
    }
    joinset.shutdown().await;
    Ok(())
}
