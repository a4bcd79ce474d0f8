use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::reducer::LessonState;

/// Checkpoints in a workflow's logical progression. Display-oriented:
/// the relay never branches on the specific stage value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Initializing,
    LessonPlanning,
    LessonPlanningComplete,
    ImageSearch,
    ImageSearchComplete,
    ImageProcessing,
    ImageProcessingComplete,
    ContentGeneration,
    ContentGenerationComplete,
    QuizGeneration,
    QuizComplete,
    Complete,
    Error,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Initializing => "initializing",
            WorkflowStage::LessonPlanning => "lesson_planning",
            WorkflowStage::LessonPlanningComplete => "lesson_planning_complete",
            WorkflowStage::ImageSearch => "image_search",
            WorkflowStage::ImageSearchComplete => "image_search_complete",
            WorkflowStage::ImageProcessing => "image_processing",
            WorkflowStage::ImageProcessingComplete => "image_processing_complete",
            WorkflowStage::ContentGeneration => "content_generation",
            WorkflowStage::ContentGenerationComplete => "content_generation_complete",
            WorkflowStage::QuizGeneration => "quiz_generation",
            WorkflowStage::QuizComplete => "quiz_complete",
            WorkflowStage::Complete => "complete",
            WorkflowStage::Error => "error",
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Target audience for a lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgeGroup {
    #[serde(rename = "elementary")]
    Elementary,
    #[serde(rename = "middle school")]
    MiddleSchool,
    #[serde(rename = "high school")]
    HighSchool,
    #[serde(rename = "college")]
    College,
    #[serde(rename = "adult")]
    Adult,
}

/// Self-reported prior knowledge of the learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeLevel {
    Beginner,
    Intermediate,
    Advanced,
}

/// Maximum accepted topic length, in characters.
const MAX_TOPIC_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum RequestValidationError {
    #[error("topic cannot be empty")]
    EmptyTopic,
    #[error("topic exceeds {MAX_TOPIC_CHARS} characters")]
    TopicTooLong,
}

/// A client-submitted lesson request. Immutable once validated; the
/// serialized form is the worker's complete input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub topic: String,
    pub age_group: AgeGroup,
    pub knowledge_level: KnowledgeLevel,
}

impl WorkflowRequest {
    pub fn validate(&self) -> Result<(), RequestValidationError> {
        if self.topic.trim().is_empty() {
            return Err(RequestValidationError::EmptyTopic);
        }
        if self.topic.chars().count() > MAX_TOPIC_CHARS {
            return Err(RequestValidationError::TopicTooLong);
        }
        Ok(())
    }
}

/// One key concept of a lesson plan, as produced by the planning stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub point_title: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub visual_type: String,
    #[serde(default)]
    pub visual_description: String,
    #[serde(default)]
    pub search_query: String,
}

/// An image candidate with its ranking score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredImage {
    pub url: String,
    #[serde(default)]
    pub score: u32,
}

/// Image search and processing results for one key point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSet {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub images: Vec<ScoredImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_image: Option<ScoredImage>,
}

/// Partial snapshot fields carried by a `progress` message. Absent (or
/// null) fields leave the accumulated state untouched; present fields
/// overwrite, last write wins per field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_plan: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_points: Option<Vec<KeyPoint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images_data: Option<HashMap<String, ImageSet>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzed_descriptions: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_processing: Option<WorkflowStage>,
}

/// Streamed content fragment for one key point. `complete` marks the
/// final (possibly empty) chunk for that point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChunk {
    pub point_title: String,
    pub chunk: String,
    #[serde(default)]
    pub complete: bool,
}

/// One line of the worker's stdout protocol. A worker emits zero or
/// more `progress`/`content_chunk` messages followed by at most one
/// terminal `complete`; `error` messages are informational and do not
/// end the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Progress {
        stage: WorkflowStage,
        progress: f64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ProgressData>,
    },
    ContentChunk {
        data: ContentChunk,
    },
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
}

/// Inbound client frame on the live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    GenerateLesson { data: WorkflowRequest },
}

/// Progress payload forwarded to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: WorkflowStage,
    pub progress: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ProgressData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

/// Outbound relay frame, one JSON object per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Progress { data: ProgressEvent },
    ContentChunk { data: ContentChunk },
    Complete { data: Box<LessonState> },
    Error { data: ErrorEvent },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            data: ErrorEvent {
                message: message.into(),
            },
        }
    }

    /// Whether this event ends the workflow on the client side.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerEvent::Complete { .. })
    }
}
