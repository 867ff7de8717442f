use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AnimaId, EventId, MemoryEventId, MemoryId};

use super::{Embedding, Metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryState {
    Active,
    Decaying,
    Archived,
}

impl MemoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryState::Active => "active",
            MemoryState::Decaying => "decaying",
            MemoryState::Archived => "archived",
        }
    }
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MemoryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MemoryState::Active),
            "decaying" => Ok(MemoryState::Decaying),
            "archived" => Ok(MemoryState::Archived),
            other => Err(format!("unknown memory state: {other}")),
        }
    }
}

/// A consolidated interpretation of one or more events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub anima_id: AnimaId,
    pub content: String,
    pub summary: String,
    pub importance: Option<f64>,
    pub confidence: Option<f64>,
    pub state: MemoryState,
    pub recency_score: Option<f64>,
    pub decay_score: Option<f64>,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub metadata: Metadata,
    pub embedding: Option<Embedding>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    pub fn new(anima_id: AnimaId, content: impl Into<String>, summary: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MemoryId::new(),
            anima_id,
            content: content.into(),
            summary: summary.into(),
            importance: None,
            confidence: None,
            state: MemoryState::Active,
            recency_score: None,
            decay_score: None,
            time_start: now,
            time_end: now,
            metadata: super::empty_metadata(),
            embedding: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn merged_from(&self) -> Vec<MemoryId> {
        self.metadata
            .get("merged_from")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| s.parse::<uuid::Uuid>().ok())
                    .map(MemoryId::from_uuid)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Provenance junction row linking a memory to one of its source events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: MemoryEventId,
    pub memory_id: MemoryId,
    pub event_id: EventId,
    pub link_strength: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl MemoryEvent {
    pub fn new(memory_id: MemoryId, event_id: EventId) -> Self {
        Self {
            id: MemoryEventId::new(),
            memory_id,
            event_id,
            link_strength: None,
            created_at: Utc::now(),
        }
    }
}
