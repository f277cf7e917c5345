use std::{
    future::{Future, IntoFuture},
    net::SocketAddr,
};

use anyhow::{Context, Result, bail};
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{
    connection,
    hub::{Hub, HubHandle},
};

/// The relay server: one hub task plus an axum upgrade endpoint.
pub struct Server {
    listener: TcpListener,
    hub: Hub,
    handle: HubHandle,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        let (hub, handle) = Hub::new();
        Self {
            listener,
            hub,
            handle,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            hub,
            handle,
        } = self;

        let mut hub_task = tokio::spawn(hub.run());
        let serve = axum::serve(listener, app(handle))
            .with_graceful_shutdown(shutdown)
            .into_future();

        tokio::select! {
            result = serve => result.context("server error")?,
            // The hub owns all membership state; if its event loop stops
            // while we are still accepting connections, the process cannot
            // limp along without it.
            _ = &mut hub_task => bail!("hub event loop stopped unexpectedly"),
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn app(handle: HubHandle) -> Router {
    Router::new()
        .route("/chat/:channel", get(connection::chat_route))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}
