//! API server setup.

use axum::Router;
use axum::extract::Request;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::stream::StreamManager;

/// Shared state of all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StreamManager>,
    pub config: Arc<AppConfig>,
    pub logging: Option<Arc<LoggingConfig>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(manager: Arc<StreamManager>, config: Arc<AppConfig>) -> Self {
        Self {
            manager,
            config,
            logging: None,
            start_time: Instant::now(),
        }
    }

    /// Expose the log filter over the API.
    pub fn with_logging(mut self, logging: Arc<LoggingConfig>) -> Self {
        self.logging = Some(logging);
        self
    }
}

pub struct ApiServer {
    bind_address: String,
    state: AppState,
}

impl ApiServer {
    pub fn new(bind_address: impl Into<String>, state: AppState) -> Self {
        Self {
            bind_address: bind_address.into(),
            state,
        }
    }

    pub fn build_router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        routes::create_router(self.state.clone()).layer(cors).layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request| {
                if req.uri().path().starts_with("/health") {
                    Span::none()
                } else {
                    tracing::info_span!("http", method = %req.method(), uri = %req.uri())
                }
            }),
        )
    }

    /// Serve until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| Error::config(format!("Invalid bind address {}: {}", self.bind_address, e)))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("API server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await?;

        Ok(())
    }
}
