use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::{AnimaId, EventId};

use super::Metadata;

/// The closed set of event types. The original models tool/system events as
/// reserved-but-not-yet-enumerated; `Other` carries the raw string so a
/// forward-compatible reader doesn't need to reject unknown values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(rename = "message.in")]
    MessageIn,
    #[serde(rename = "message.out")]
    MessageOut,
    ToolCall,
    ToolResult,
    System,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::MessageIn => "message.in",
            EventType::MessageOut => "message.out",
            EventType::ToolCall => "tool.call",
            EventType::ToolResult => "tool.result",
            EventType::System => "system",
            EventType::Other(s) => s,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, EventType::MessageIn | EventType::MessageOut)
    }
}

impl std::str::FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "message.in" => EventType::MessageIn,
            "message.out" => EventType::MessageOut,
            "tool.call" => EventType::ToolCall,
            "tool.result" => EventType::ToolResult,
            "system" => EventType::System,
            other => EventType::Other(other.to_string()),
        })
    }
}

/// An atomic experience belonging to an anima.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub anima_id: AnimaId,
    pub event_type: EventType,
    pub role: Option<String>,
    pub author: Option<String>,
    pub content: String,
    pub summary: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub session: Option<String>,
    pub metadata: Metadata,
    pub source_uri: Option<String>,
    pub dedupe_key: Option<String>,
    pub importance: Option<f64>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Constructs an event occurring `now`, with no role/author/summary/
    /// session/source/dedupe-key/importance set; callers fill those in
    /// before `create_event` as needed.
    pub fn new(anima_id: AnimaId, event_type: EventType, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EventId::new(),
            anima_id,
            event_type,
            role: None,
            author: None,
            content: content.into(),
            summary: None,
            occurred_at: now,
            session: None,
            metadata: super::empty_metadata(),
            source_uri: None,
            dedupe_key: None,
            importance: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// `sha256(anima|type|first-100-chars(content)|occurred_at|source)`,
    /// truncated to 32 hex chars, per spec §3.
    pub fn compute_dedupe_key(
        anima_id: AnimaId,
        event_type: &EventType,
        content: &str,
        occurred_at: DateTime<Utc>,
        source_uri: Option<&str>,
    ) -> String {
        let truncated: String = content.chars().take(100).collect();
        let raw = format!(
            "{}|{}|{}|{}|{}",
            anima_id,
            event_type.as_str(),
            truncated,
            occurred_at.to_rfc3339(),
            source_uri.unwrap_or(""),
        );
        let digest = Sha256::digest(raw.as_bytes());
        let full = hex::encode(digest);
        full[..32].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_key_is_deterministic() {
        let anima = AnimaId::new();
        let t = Utc::now();
        let a = Event::compute_dedupe_key(anima, &EventType::MessageIn, "hello world", t, None);
        let b = Event::compute_dedupe_key(anima, &EventType::MessageIn, "hello world", t, None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn dedupe_key_changes_with_content() {
        let anima = AnimaId::new();
        let t = Utc::now();
        let a = Event::compute_dedupe_key(anima, &EventType::MessageIn, "hello", t, None);
        let b = Event::compute_dedupe_key(anima, &EventType::MessageIn, "goodbye", t, None);
        assert_ne!(a, b);
    }
}
