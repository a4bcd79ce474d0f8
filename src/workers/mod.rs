use std::fmt;

pub mod supervisor;

/// Selector for which external worker script a request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Streaming lesson workflow (progress/content_chunk/complete lines).
    LessonWorkflow,
    /// Roadmap generation (metadata/phase record lines).
    RoadmapStream,
    /// Topic content generation (single trailing JSON object).
    TopicContent,
}

impl WorkerKind {
    pub fn script_name(&self) -> &'static str {
        match self {
            WorkerKind::LessonWorkflow => "workflow_runner.py",
            WorkerKind::RoadmapStream => "roadmap_generator.py",
            WorkerKind::TopicContent => "topic_content_generator.py",
        }
    }

    /// Environment variable carrying the worker's fully serialized
    /// input. The payload is complete before spawn; the worker sees a
    /// static document.
    pub fn input_env(&self) -> &'static str {
        match self {
            WorkerKind::LessonWorkflow => "LESSON_INPUT",
            WorkerKind::RoadmapStream => "ROADMAP_INPUT",
            WorkerKind::TopicContent => "TOPIC_CONTENT_INPUT",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::LessonWorkflow => "lesson_workflow",
            WorkerKind::RoadmapStream => "roadmap_stream",
            WorkerKind::TopicContent => "topic_content",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
