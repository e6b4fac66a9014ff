use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::registry::{ConnectionRegistry, ConnectionSummary};

#[derive(Clone)]
pub struct DashboardState {
    pub registry: Arc<ConnectionRegistry>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    nodes: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Routes served by the status dashboard.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/nodes", get(list_nodes_handler))
        .route("/api/nodes/:urn", get(node_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn health_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        nodes: state.registry.len().await,
    })
}

async fn list_nodes_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let nodes: Vec<ConnectionSummary> = state.registry.summaries().await;
    Json(nodes)
}

async fn node_handler(
    State(state): State<DashboardState>,
    Path(urn): Path<String>,
) -> Response {
    match state.registry.get(&urn).await {
        Some(conn) => Json(ConnectionSummary {
            urn: conn.urn().to_string(),
            state: conn.state(),
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Unknown node URN: {}", urn),
            }),
        )
            .into_response(),
    }
}
