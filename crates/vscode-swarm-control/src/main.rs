//! VS Code Swarm controller service.
//!
//! Runs the fleet controller and exposes liveness and readiness endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vscode_swarm_control::{ControllerConfig, SwarmController};

#[derive(Clone)]
struct AppState {
    controller: Arc<SwarmController>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "vscode-swarm-control",
    })
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.controller.is_initialized() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vscode_swarm=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting VS Code Swarm controller");

    let config = match std::env::var("SWARM_CONFIG") {
        Ok(path) => {
            tracing::info!(path = %path, "Loading configuration file");
            ControllerConfig::from_file(&path)?
        }
        Err(_) => ControllerConfig::from_env(),
    };
    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let controller = Arc::new(SwarmController::new(config));
    controller.initialize().await?;

    let app = create_router(AppState {
        controller: Arc::clone(&controller),
    });

    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    controller.dispose().await;
    served?;
    Ok(())
}
