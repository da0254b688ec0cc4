//! Application setup and server configuration.

use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::kernel::metrics::{metrics_handler, register_metrics};
use crate::kernel::ServerKernel;
use crate::server::auth::JwtService;
use crate::server::routes::{health_handler, ws_handler};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<ServerKernel>,
    pub jwt: Arc<JwtService>,
    pub app_version: String,
}

/// Build the HTTP surface: health, metrics, and the live job stream.
pub fn build_app(kernel: Arc<ServerKernel>, config: &Config) -> Router {
    register_metrics();

    let state = AppState {
        kernel,
        jwt: Arc::new(JwtService::new(&config.jwt_secret, config.jwt_issuer.clone())),
        app_version: config.app_version.clone(),
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/jobs/{project_id}", get(ws_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}
