//! Protected image HTTP server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::Method, middleware, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::error::GatewayError;
use super::routes::{health, security_middleware, serve_protected, GatewayState, ViewerResolver};
use super::service::ProtectionGateway;
use crate::core::config::ServerConfig;

/// Path of the protected image route
pub const PROTECTED_ROUTE: &str = "/protected";

/// HTTP front for a [`ProtectionGateway`]
pub struct GatewayServer {
    state: GatewayState,
    address: SocketAddr,
}

impl GatewayServer {
    pub fn new(gateway: Arc<ProtectionGateway>, config: &ServerConfig) -> Result<Self, GatewayError> {
        let address = config
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|_| GatewayError::InvalidAddress {
                address: config.bind_address.clone(),
            })?;
        Ok(Self {
            state: GatewayState {
                gateway,
                viewers: ViewerResolver::new(&config.viewer_header)?,
            },
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Build the router with all routes and middleware
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(&self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.address)
            .await
            .map_err(|e| GatewayError::BindFailed { reason: e.to_string() })?;
        tracing::info!("Protection gateway listening on {}", self.address);

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| GatewayError::Internal { reason: e.to_string() })?;

        tracing::info!("Protection gateway stopped");
        Ok(())
    }
}

/// Router over shared gateway state
pub fn build_router(state: GatewayState) -> Router {
    // Protected images are embedded cross-origin; only reads are allowed
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_origin(Any);

    Router::new()
        .route(PROTECTED_ROUTE, get(serve_protected))
        .route("/health", get(health))
        .layer(middleware::from_fn(security_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
