use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AnimaId, KnowledgeAuditLogId, KnowledgeId, MemoryId};

use super::Embedding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KnowledgeType {
    Fact,
    Concept,
    Method,
    Principle,
    Experience,
}

impl KnowledgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeType::Fact => "FACT",
            KnowledgeType::Concept => "CONCEPT",
            KnowledgeType::Method => "METHOD",
            KnowledgeType::Principle => "PRINCIPLE",
            KnowledgeType::Experience => "EXPERIENCE",
        }
    }
}

impl std::str::FromStr for KnowledgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FACT" => Ok(KnowledgeType::Fact),
            "CONCEPT" => Ok(KnowledgeType::Concept),
            "METHOD" => Ok(KnowledgeType::Method),
            "PRINCIPLE" => Ok(KnowledgeType::Principle),
            "EXPERIENCE" => Ok(KnowledgeType::Experience),
            other => Err(format!("unknown knowledge type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KnowledgeSourceType {
    Internal,
    External,
}

/// A distilled, durable fact derived from one or more memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: KnowledgeId,
    pub anima_id: AnimaId,
    pub knowledge_type: KnowledgeType,
    pub topic: Option<String>,
    pub content: String,
    pub summary: String,
    pub confidence: f64,
    pub source_type: KnowledgeSourceType,
    pub embedding: Option<Embedding>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeItem {
    pub fn new(
        anima_id: AnimaId,
        knowledge_type: KnowledgeType,
        content: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: KnowledgeId::new(),
            anima_id,
            knowledge_type,
            topic: None,
            content: content.into(),
            summary: summary.into(),
            confidence: 0.5,
            source_type: KnowledgeSourceType::Internal,
            embedding: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KnowledgeAction {
    Create,
    Update,
    Delete,
    Restore,
}

/// Immutable append-only audit trail for knowledge mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeAuditLog {
    pub id: KnowledgeAuditLogId,
    pub knowledge_id: KnowledgeId,
    pub action: KnowledgeAction,
    pub source_type: String,
    pub source_id: Option<MemoryId>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub change_summary: Option<String>,
    pub trigger: String,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeAuditLog {
    pub fn new(
        knowledge_id: KnowledgeId,
        action: KnowledgeAction,
        source_type: impl Into<String>,
        trigger: impl Into<String>,
    ) -> Self {
        Self {
            id: KnowledgeAuditLogId::new(),
            knowledge_id,
            action,
            source_type: source_type.into(),
            source_id: None,
            before: None,
            after: None,
            change_summary: None,
            trigger: trigger.into(),
            created_at: Utc::now(),
        }
    }
}
