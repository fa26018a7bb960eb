use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{handlers::*, LogView};

pub struct LogServer {
    view: Arc<LogView>,
    addr: SocketAddr,
}

impl LogServer {
    pub fn new(view: LogView, addr: SocketAddr) -> Self {
        Self {
            view: Arc::new(view),
            addr,
        }
    }

    pub fn router(view: Arc<LogView>) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/namespaces", get(list_namespaces))
            .route("/namespaces/:ns/log", get(read_log))
            .with_state(view)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("binding log server to {}", self.addr))?;
        Self::serve(listener, self.view, shutdown).await
    }

    pub async fn serve(
        listener: TcpListener,
        view: Arc<LogView>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "transaction log server listening");

        axum::serve(listener, Self::router(view))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("log server terminated")?;

        info!(%addr, "transaction log server stopped");
        Ok(())
    }
}
