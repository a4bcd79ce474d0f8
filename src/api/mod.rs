pub mod content;
pub mod roadmap;

use axum::{
    routing::{get, post},
    Router,
};

use crate::error::AppError;
use crate::server::AppState;
use crate::workers::supervisor::ExitReason;

/// Create the API router with all endpoint routes
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .route("/generate-roadmap", post(roadmap::generate_roadmap))
        .route(
            "/generate-topic-content",
            post(content::generate_topic_content),
        )
        .route("/roadmaps", get(roadmap::list_roadmaps))
        .route("/roadmaps/:roadmap_id", get(roadmap::get_roadmap))
}

/// Terminal error for a buffered worker run that produced no usable
/// result.
pub(crate) fn worker_failure(what: &str, reason: &ExitReason, stderr_tail: String) -> AppError {
    let message = match reason {
        ExitReason::Clean => format!("{what} exited without a result"),
        ExitReason::Failed { code } => format!(
            "{what} failed (exit code {})",
            code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
        ),
        ExitReason::TimedOut => format!("{what} timed out"),
        ExitReason::OutputOverflow => format!("{what} produced oversized output"),
    };
    AppError::Worker {
        message,
        details: stderr_tail,
    }
}
