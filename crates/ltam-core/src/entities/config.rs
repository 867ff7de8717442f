use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::AnimaId;

/// Per-anima synthesis tuning (1:1). Defaults materialize on first access
/// (see [`crate::store::Store::get_or_create_synthesis_config`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub anima_id: AnimaId,
    pub time_weight: f64,
    pub event_weight: f64,
    pub token_weight: f64,
    pub threshold: f64,
    pub llm_temperature: f64,
    pub max_tokens: u32,
    pub scheduler_interval_hours: u32,
    pub last_synthesis_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SynthesisConfig {
    pub fn default_for(anima_id: AnimaId) -> Self {
        let now = Utc::now();
        Self {
            anima_id,
            time_weight: 1.0,
            event_weight: 0.5,
            token_weight: 0.0003,
            threshold: 10.0,
            llm_temperature: 0.3,
            max_tokens: 1024,
            scheduler_interval_hours: 1,
            last_synthesis_check_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-anima 1:1 deep-merged JSON settings governing capture and
/// pack-compilation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    pub anima_id: AnimaId,
    pub read_settings: serde_json::Value,
    pub write_settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IoConfig {
    pub fn default_for(anima_id: AnimaId) -> Self {
        let now = Utc::now();
        Self {
            anima_id,
            read_settings: serde_json::json!({}),
            write_settings: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-anima 1:1 free-form self-model, rendered as prose by the pack
/// compiler (§4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySelfModel {
    pub anima_id: AnimaId,
    pub name: String,
    pub personality_type: Option<String>,
    pub communication_style: Option<String>,
    /// Nested self-reflection tree: `being`, `purpose`, `principles`,
    /// `philosophy`, `relational`, `arc`.
    pub self_reflection: serde_json::Value,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdentitySelfModel {
    pub fn new(anima_id: AnimaId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            anima_id,
            name: name.into(),
            personality_type: None,
            communication_style: None,
            self_reflection: serde_json::json!({}),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}
