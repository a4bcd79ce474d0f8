use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// A generated roadmap retained in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRoadmap {
    pub id: String,
    pub topic: String,
    pub created_at: DateTime<Utc>,
    pub roadmap: serde_json::Value,
}

/// History listing entry without the roadmap body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadmapSummary {
    pub id: String,
    pub topic: String,
    pub created_at: DateTime<Utc>,
}

struct Entries {
    by_id: HashMap<String, StoredRoadmap>,
    /// Insertion order, oldest first; drives eviction.
    order: VecDeque<String>,
}

/// Capacity-bounded in-memory roadmap history, injected through
/// `AppState` rather than held as ambient shared state. Eviction is
/// FIFO: when full, the oldest entry makes room for the newest.
pub struct RoadmapStore {
    capacity: usize,
    entries: RwLock<Entries>,
}

impl RoadmapStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(Entries {
                by_id: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Store a roadmap and return its generated id.
    pub async fn insert(&self, topic: &str, roadmap: serde_json::Value) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = StoredRoadmap {
            id: id.clone(),
            topic: topic.to_string(),
            created_at: Utc::now(),
            roadmap,
        };

        let mut entries = self.entries.write().await;
        while entries.order.len() >= self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.by_id.remove(&oldest);
                debug!(roadmap_id = %oldest, "Evicted oldest roadmap from history");
            } else {
                break;
            }
        }
        entries.order.push_back(id.clone());
        entries.by_id.insert(id.clone(), entry);
        info!(roadmap_id = %id, topic = topic, "Stored roadmap in history");
        id
    }

    pub async fn get(&self, id: &str) -> Option<StoredRoadmap> {
        self.entries.read().await.by_id.get(id).cloned()
    }

    /// Summaries of all retained roadmaps, newest first.
    pub async fn list(&self) -> Vec<RoadmapSummary> {
        let entries = self.entries.read().await;
        entries
            .order
            .iter()
            .rev()
            .filter_map(|id| entries.by_id.get(id))
            .map(|entry| RoadmapSummary {
                id: entry.id.clone(),
                topic: entry.topic.clone(),
                created_at: entry.created_at,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
