use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::worker_failure;
use crate::decoder::{decode_line, Decoded};
use crate::error::AppError;
use crate::server::AppState;
use crate::workers::supervisor::ExitReason;
use crate::workers::WorkerKind;

#[derive(Debug, Deserialize)]
pub struct RoadmapRequest {
    pub topic: String,
}

/// Record shapes the roadmap worker emits, one JSON object per line:
/// a `metadata` header followed by one `phase` record per phase, or an
/// `error` record when generation fails mid-stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RoadmapRecord {
    Metadata { data: Value },
    Phase { data: Value },
    Error { error: String },
}

/// POST /api/generate-roadmap - run the roadmap worker to completion
/// and assemble its records into a single roadmap object
pub async fn generate_roadmap(
    State(state): State<AppState>,
    Json(request): Json<RoadmapRequest>,
) -> Result<impl IntoResponse, AppError> {
    let topic = request.topic.trim();
    if topic.is_empty() {
        return Err(AppError::BadRequest("topic cannot be empty".to_string()));
    }

    let run = state
        .supervisor
        .run_buffered(WorkerKind::RoadmapStream, &json!({ "topic": topic }))
        .await?;
    if run.reason != ExitReason::Clean {
        return Err(worker_failure(
            "roadmap worker",
            &run.reason,
            run.stderr_tail,
        ));
    }

    let mut metadata: Option<Value> = None;
    let mut phases: Vec<Value> = Vec::new();
    for line in run.stdout.lines() {
        match decode_line::<RoadmapRecord>(line) {
            Decoded::Parsed(RoadmapRecord::Metadata { data }) => metadata = Some(data),
            Decoded::Parsed(RoadmapRecord::Phase { data }) => phases.push(data),
            Decoded::Parsed(RoadmapRecord::Error { error }) => {
                warn!(error = %error, "Roadmap worker reported an error");
                return Err(AppError::Worker {
                    message: "roadmap generation failed".to_string(),
                    details: error,
                });
            }
            Decoded::Skipped => {}
        }
    }

    // a run with no metadata record is undecodable; echo the raw
    // output back for diagnosis
    let Some(mut roadmap) = metadata else {
        return Err(AppError::decode(&run.stdout));
    };
    let Some(fields) = roadmap.as_object_mut() else {
        return Err(AppError::decode(&run.stdout));
    };
    fields.insert("phases".to_string(), Value::Array(phases));

    let roadmap_id = state.roadmaps.insert(topic, roadmap.clone()).await;
    info!(roadmap_id = %roadmap_id, topic = topic, "Roadmap generated");

    Ok(Json(json!({
        "success": true,
        "roadmap_id": roadmap_id,
        "roadmap": roadmap,
    })))
}

/// GET /api/roadmaps - list retained roadmaps, newest first
pub async fn list_roadmaps(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let summaries = state.roadmaps.list().await;
    Ok((StatusCode::OK, Json(summaries)))
}

/// GET /api/roadmaps/:roadmap_id - fetch one retained roadmap
pub async fn get_roadmap(
    State(state): State<AppState>,
    Path(roadmap_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    match state.roadmaps.get(&roadmap_id).await {
        Some(entry) => Ok((StatusCode::OK, Json(entry))),
        None => Err(AppError::NotFound(format!(
            "Roadmap '{}' not found",
            roadmap_id
        ))),
    }
}
