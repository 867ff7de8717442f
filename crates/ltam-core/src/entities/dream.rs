use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AnimaId, DreamActionId, DreamSessionId, MemoryId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DreamTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DreamStatus {
    Running,
    Completed,
    Failed,
}

/// One curation cycle over an anima's memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DreamSession {
    pub id: DreamSessionId,
    pub anima_id: AnimaId,
    pub trigger: DreamTrigger,
    pub triggered_by_user_id: Option<UserId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: DreamStatus,
    pub error_message: Option<String>,
    pub memories_reviewed: u32,
    pub memories_modified: u32,
    pub memories_created: u32,
    pub memories_archived: u32,
    pub memories_deleted: u32,
    pub summary: Option<String>,
    pub config_snapshot: serde_json::Value,
}

impl DreamSession {
    pub fn start(anima_id: AnimaId, trigger: DreamTrigger, triggered_by_user_id: Option<UserId>) -> Self {
        Self {
            id: DreamSessionId::new(),
            anima_id,
            trigger,
            triggered_by_user_id,
            started_at: Utc::now(),
            completed_at: None,
            status: DreamStatus::Running,
            error_message: None,
            memories_reviewed: 0,
            memories_modified: 0,
            memories_created: 0,
            memories_archived: 0,
            memories_deleted: 0,
            summary: None,
            config_snapshot: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Merge,
    Split,
    Update,
    Archive,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DreamPhase {
    LightSleep,
    DeepSleep,
}

/// Immutable per-mutation audit row, child of a [`DreamSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DreamAction {
    pub id: DreamActionId,
    pub session_id: DreamSessionId,
    pub action_type: ActionType,
    pub phase: DreamPhase,
    pub source_memory_ids: Vec<MemoryId>,
    pub result_memory_ids: Option<Vec<MemoryId>>,
    pub before_state: serde_json::Value,
    pub after_state: Option<serde_json::Value>,
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}
