use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AnimaId, MemoryPackId};

/// A persisted compiled pack artefact (§4.5, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPack {
    pub id: MemoryPackId,
    pub anima_id: AnimaId,
    pub query: Option<String>,
    pub preset: Option<String>,
    pub session_count: u32,
    pub knowledge_count: u32,
    pub long_term_count: u32,
    pub token_count: u32,
    pub max_tokens: u32,
    pub content: serde_json::Value,
    pub compiled_at: DateTime<Utc>,
}
