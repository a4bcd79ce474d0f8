use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::protocol::{
    AgeGroup, ImageSet, KeyPoint, KnowledgeLevel, ProgressData, WorkerMessage, WorkflowRequest,
    WorkflowStage,
};

/// Accumulating snapshot of one workflow, rebuilt by folding the event
/// stream. Every applied event enriches the snapshot; nothing is
/// dropped by a later partial update. The single exception is the
/// per-field overwrite of `progress` snapshot data, which is
/// last-write-wins by design of the worker protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonState {
    pub topic: String,
    pub age_group: AgeGroup,
    pub knowledge_level: KnowledgeLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_plan: Option<serde_json::Value>,
    #[serde(default)]
    pub key_points: Vec<KeyPoint>,
    #[serde(default)]
    pub images_data: HashMap<String, ImageSet>,
    #[serde(default)]
    pub analyzed_descriptions: HashMap<String, String>,
    #[serde(default)]
    pub content_data: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz: Option<String>,
    pub current_processing: WorkflowStage,
    #[serde(default)]
    pub completed_points: BTreeSet<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl LessonState {
    /// Fresh snapshot for a newly started workflow.
    pub fn new(request: &WorkflowRequest) -> Self {
        Self {
            topic: request.topic.clone(),
            age_group: request.age_group,
            knowledge_level: request.knowledge_level,
            lesson_plan: None,
            key_points: Vec::new(),
            images_data: HashMap::new(),
            analyzed_descriptions: HashMap::new(),
            content_data: HashMap::new(),
            quiz: None,
            current_processing: WorkflowStage::Initializing,
            completed_points: BTreeSet::new(),
            errors: Vec::new(),
        }
    }

    /// Fold one worker message into the snapshot.
    pub fn apply(&mut self, message: &WorkerMessage) {
        match message {
            WorkerMessage::Progress { stage, data, .. } => {
                self.current_processing = *stage;
                if let Some(data) = data {
                    self.merge_progress_data(data);
                }
            }
            WorkerMessage::ContentChunk { data } => {
                self.content_data
                    .entry(data.point_title.clone())
                    .or_default()
                    .push_str(&data.chunk);
                if data.complete {
                    self.completed_points.insert(data.point_title.clone());
                }
            }
            WorkerMessage::Complete { .. } => {
                self.current_processing = WorkflowStage::Complete;
            }
            WorkerMessage::Error { message } => {
                self.errors.push(message.clone());
            }
        }
    }

    /// Shallow-merge a partial snapshot: present fields overwrite,
    /// absent fields leave accumulated values alone. The worker's own
    /// `current_processing` (a finer-grained value than the stage tag)
    /// wins when it is present.
    fn merge_progress_data(&mut self, data: &ProgressData) {
        if let Some(lesson_plan) = &data.lesson_plan {
            self.lesson_plan = Some(lesson_plan.clone());
        }
        if let Some(key_points) = &data.key_points {
            self.key_points = key_points.clone();
        }
        if let Some(images_data) = &data.images_data {
            self.images_data = images_data.clone();
        }
        if let Some(analyzed_descriptions) = &data.analyzed_descriptions {
            self.analyzed_descriptions = analyzed_descriptions.clone();
        }
        if let Some(quiz) = &data.quiz {
            self.quiz = Some(quiz.clone());
        }
        if let Some(current_processing) = data.current_processing {
            self.current_processing = current_processing;
        }
    }
}
