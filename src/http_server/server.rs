//! # HTTP Server
//!
//! Combines the trigger, firehose and operator routers into one axum app.

use std::net::SocketAddr;

use axum::{extract::DefaultBodyLimit, http::HeaderValue, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::admin_routes::admin_routes;
use super::firehose_routes::firehose_routes;
use super::invoke_routes::invoke_routes;
use super::state::AppState;
use crate::config::HttpConfig;

/// Build the application router
///
/// CORS is applied to the operator routes only. Trigger routes answer
/// their own preflights according to each subscription's options.
pub fn build_router(config: &HttpConfig, state: AppState) -> Router {
    let cors = if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .merge(admin_routes().layer(cors))
        .merge(invoke_routes())
        .merge(firehose_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(config.body_limit_bytes)),
        )
        .with_state(state)
}

/// Bound HTTP listener
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
    shutdown_tx: broadcast::Sender<()>,
}

impl HttpServer {
    /// Bind the listener. Failure here is fatal for the process.
    pub async fn bind(config: &HttpConfig, state: AppState) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.socket_addr()).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            listener,
            router: build_router(config, state),
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve until shut down
    pub async fn run(self) -> std::io::Result<()> {
        let addr = self.listener.local_addr()?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(addr = %addr, "HTTP server listening");

        axum::serve(
            self.listener,
            self.router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}
