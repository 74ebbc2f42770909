use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::{oneshot, Mutex};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

use crate::acme::Manager;

use super::handlers;
use super::state::AppState;

/// Hosts the lifecycle manager and serves its control surface.
pub struct Server {
    listen: SocketAddr,
    manager: Arc<Manager>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Server {
    pub fn new(listen: SocketAddr, manager: Arc<Manager>) -> Self {
        Self {
            listen,
            manager,
            shutdown: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    fn build_app(&self) -> Router {
        let state = Arc::new(AppState::new(self.manager.clone()));
        handlers::router(state).layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO)),
        )
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.manager.clone().start();

        let app = self.build_app();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown.lock().await = Some(shutdown_tx);
        tracing::debug!("listening for control requests on {}", self.listen);
        axum::Server::try_bind(&self.listen)?
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move {
                shutdown_rx.await.ok();
            })
            .await
            .map_err(|err| err.into())
    }

    pub async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            shutdown.send(()).ok();
        }
    }
}
