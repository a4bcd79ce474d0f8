use axum::{
    extract::State,
    http::Method,
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    api::create_api_router, config::Config, error::Result, relay::websocket_handler,
    store::RoadmapStore, workers::supervisor::WorkerSupervisor,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub supervisor: Arc<WorkerSupervisor>,
    pub roadmaps: Arc<RoadmapStore>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let supervisor = Arc::new(WorkerSupervisor::new(config.clone()));
        let roadmaps = Arc::new(RoadmapStore::new(config.roadmap_history_capacity));
        Self {
            config,
            supervisor,
            roadmaps,
        }
    }
}

/// Assemble the application router. Split from [`run_server`] so tests
/// can drive the router without binding a port.
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ])
        .allow_origin(axum::http::header::HeaderValue::from_static("*"));

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .nest("/api", create_api_router())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)) // 1 MiB
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let state = AppState::new(config.clone());
    let app = create_app(state);

    let address = config.server_address();
    info!("Server listening on {}", address);
    info!("WebSocket workflow streaming enabled at /ws");

    let listener = tokio::net::TcpListener::bind(&address).await?;
    match axum::serve(listener, app).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => error!("Server error: {}", e),
    }

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "lesson-relay",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "workers_dir": state.config.workers_dir.display().to_string(),
    }))
}
