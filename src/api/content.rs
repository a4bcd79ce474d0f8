use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::worker_failure;
use crate::decoder::{decode_line, Decoded};
use crate::error::AppError;
use crate::server::AppState;
use crate::workers::supervisor::ExitReason;
use crate::workers::WorkerKind;

#[derive(Debug, Deserialize)]
pub struct TopicContentRequest {
    pub topic: String,
    #[serde(default)]
    pub phase: String,
    pub topic_title: String,
}

/// The topic-content worker prints a single trailing JSON object, in
/// one of two shapes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TopicContentResult {
    Success {
        success: bool,
        content: String,
        topic: String,
    },
    Failure {
        error: String,
    },
}

/// POST /api/generate-topic-content - run the topic-content worker and
/// return its result object
pub async fn generate_topic_content(
    State(state): State<AppState>,
    Json(request): Json<TopicContentRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.topic.trim().is_empty() || request.topic_title.trim().is_empty() {
        return Err(AppError::BadRequest(
            "topic and topic_title are required".to_string(),
        ));
    }

    let payload = json!({
        "topic": request.topic,
        "phase": request.phase,
        "topic_title": request.topic_title,
    });
    let run = state
        .supervisor
        .run_buffered(WorkerKind::TopicContent, &payload)
        .await?;

    // the worker reports its own failures as a JSON object and exits
    // non-zero, so look for the trailing object before judging the
    // exit code
    let result = run
        .stdout
        .lines()
        .rev()
        .find_map(|line| match decode_line::<TopicContentResult>(line) {
            Decoded::Parsed(result) => Some(result),
            Decoded::Skipped => None,
        });

    match result {
        Some(TopicContentResult::Success {
            success,
            content,
            topic,
        }) if success => {
            info!(topic = %topic, "Topic content generated");
            Ok(Json(json!({
                "success": true,
                "content": content,
                "topic": topic,
            })))
        }
        Some(TopicContentResult::Success { topic, .. }) => Err(AppError::Worker {
            message: format!("topic content generation failed for '{topic}'"),
            details: run.stderr_tail,
        }),
        Some(TopicContentResult::Failure { error }) => Err(AppError::Worker {
            message: "topic content generation failed".to_string(),
            details: error,
        }),
        None if run.reason == ExitReason::Clean => Err(AppError::decode(&run.stdout)),
        None => Err(worker_failure(
            "topic content worker",
            &run.reason,
            run.stderr_tail,
        )),
    }
}
