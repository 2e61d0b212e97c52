//! Server state, lifecycle and error type.
//!
//! [`FaultServer`] binds the listener and owns the shared [`ServerState`];
//! [`FaultServer::spawn`] runs it in the background and returns a
//! [`ServerHandle`] for tests and embedders.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::header::CONNECTION;
use axum::http::HeaderValue;
use axum::middleware;
use axum::response::Response;
use bytes::Bytes;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::assets::ImageAssets;
use crate::config::ServerConfig;
use crate::listener::FaultListener;
use crate::records::RecordStore;
use crate::routes;
use crate::scenario::{fault_table, FaultScenario, API_BASE};

/// Errors raised while starting or running the server.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image rendering failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// State shared by every handler.
#[derive(Debug)]
pub struct ServerState {
    pub config: ServerConfig,
    pub records: RecordStore,
    /// `/large-body` payload, built once.
    pub large_body: Bytes,
    pub images: ImageAssets,
    /// `/stream-xhr` producers still running.
    pub active_streams: AtomicUsize,
    pub table: Vec<FaultScenario>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let large_body = Bytes::from("X ".repeat(config.large_body_bytes / 2));
        let images = ImageAssets::new(config.image_size, config.large_image_size);
        let table = fault_table(&config);
        Self {
            config,
            records: RecordStore::seeded(),
            large_body,
            images,
            active_streams: AtomicUsize::new(0),
            table,
        }
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }
}

/// A bound, not yet running fault server.
pub struct FaultServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
}

impl FaultServer {
    /// Binds `config.bind`. Port 0 picks a free port.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = config.bind;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(ServerState::new(config)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://<addr>/api`, the base URL clients join route paths onto.
    pub fn base_url(&self) -> String {
        base_url(self.local_addr)
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Serves until `shutdown` fires.
    ///
    /// In-flight requests get `shutdown_grace` to finish; hung and streaming
    /// connections still open after that are dropped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let grace = self.state.config.shutdown_grace;
        let local_addr = self.local_addr;
        let app = routes::router(self.state)
            .layer(middleware::map_response(close_after_response))
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http());
        let listener = FaultListener::new(self.listener, shutdown.clone())?;

        info!(%local_addr, "Fault server listening");
        let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown.clone().cancelled_owned());

        tokio::select! {
            result = serve.into_future() => result?,
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!(?grace, "Grace period elapsed, dropping open connections");
            }
        }
        info!("Fault server stopped");
        Ok(())
    }

    /// Runs the server on a background task.
    pub fn spawn(self) -> ServerHandle {
        let shutdown = CancellationToken::new();
        let local_addr = self.local_addr;
        let state = self.state.clone();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = self.run(token).await {
                warn!(error = %e, "Fault server failed");
            }
        });
        ServerHandle {
            local_addr,
            state,
            shutdown,
            task: Some(task),
        }
    }
}

/// Every connection carries exactly one exchange, so each request reaches
/// the listener's transport override check.
async fn close_after_response(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn base_url(addr: SocketAddr) -> String {
    format!("http://{addr}{API_BASE}")
}

/// A running server. Dropping it stops the server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_url(&self) -> String {
        base_url(self.local_addr)
    }

    /// Full URL of a route path such as `/get`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url())
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Stops the server and waits for it to wind down.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
