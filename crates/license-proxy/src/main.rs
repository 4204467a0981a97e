//! license-proxy HTTP Server
//!
//! Axum-based proxy that attaches the server-held credential to license
//! generation requests and forwards them to the issuing backend.

mod config;
mod handlers;
mod state;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ProxyConfig;
use crate::handlers::{generate_license, health_check};
use crate::state::AppState;

/// Build the proxy router
pub fn router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/license/generate", post(generate_license))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let config = ProxyConfig::from_env();
    if config.credential_configured() {
        tracing::info!("✓ License backend credential configured");
    } else {
        tracing::warn!("⚠ LICENSE_API_TOKEN not set - license requests will fail with 500");
    }

    let addr = config.bind_addr.clone();
    let backend_url = config.backend_url.clone();
    let app = router(AppState::new(config)?);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("license-proxy running on http://{}", addr);
    tracing::info!("Forwarding to {}", backend_url);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health               - Health check");
    tracing::info!("  POST /api/license/generate - Generate license code");

    axum::serve(listener, app).await?;

    Ok(())
}
