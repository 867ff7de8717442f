//! Persisted entity definitions (§3 of the data model).
//!
//! Every entity carries `id`, `created_at`, `updated_at`, and — where the
//! entity supports soft-delete — `is_deleted`. Entities with no
//! `is_deleted` field (the junction and audit-log rows) are hard-deleted on
//! cascade instead.

mod anima;
mod api_key;
mod config;
mod dream;
mod event;
mod knowledge;
mod memory;
mod pack;

pub use anima::Anima;
pub use api_key::ApiKey;
pub use config::{IdentitySelfModel, IoConfig, SynthesisConfig};
pub use dream::{ActionType, DreamAction, DreamPhase, DreamSession, DreamStatus, DreamTrigger};
pub use event::{Event, EventType};
pub use knowledge::{
    KnowledgeAction, KnowledgeAuditLog, KnowledgeItem, KnowledgeSourceType, KnowledgeType,
};
pub use memory::{Memory, MemoryEvent, MemoryState};
pub use pack::MemoryPack;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity kinds [`crate::tenancy::resolve_owner`] knows how to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Anima,
    Memory,
    Event,
    Knowledge,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Anima => "anima",
            EntityKind::Memory => "memory",
            EntityKind::Event => "event",
            EntityKind::Knowledge => "knowledge",
        }
    }
}

/// A free-form JSON metadata map, used by several entities.
pub type Metadata = serde_json::Value;

pub fn empty_metadata() -> Metadata {
    serde_json::json!({})
}

/// Embedding vector with the model tag that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: String,
}

impl Embedding {
    pub const DIMENSIONS: usize = 1536;

    pub fn new(vector: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            vector,
            model: model.into(),
        }
    }
}

/// Timestamps common to every persisted row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Timestamps {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
        }
    }
}
