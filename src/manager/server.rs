//! # Manager HTTP Listeners
//!
//! Plain HTTP listeners for the Prometheus metrics endpoint and the health probes.
//! Both are bound while the manager is built, so an address conflict fails
//! startup instead of surfacing later.

use crate::constants::MANAGER_LOG;
use crate::observability::metrics;
use anyhow::Result;
use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Router serving `/metrics` from the global registry
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> (StatusCode, String) {
    match metrics::gather_text() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            error!(target: MANAGER_LOG, "Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error encoding metrics: {e}"),
            )
        }
    }
}

/// An already bound HTTP listener, run by the manager as a runnable
#[derive(Debug)]
pub struct HttpServer {
    name: &'static str,
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    pub fn from_listener(name: &'static str, listener: TcpListener, router: Router) -> Self {
        Self {
            name,
            listener,
            router,
        }
    }
}

#[async_trait]
impl super::Runnable for HttpServer {
    fn name(&self) -> &str {
        self.name
    }

    fn needs_leader_election(&self) -> bool {
        false
    }

    async fn start(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let addr = self.listener.local_addr()?;
        info!(target: MANAGER_LOG, server = self.name, %addr, "Starting {} server", self.name);

        axum::serve(self.listener, self.router.layer(TraceLayer::new_for_http()))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!(target: MANAGER_LOG, server = self.name, "{} server stopped", self.name);
        Ok(())
    }
}
