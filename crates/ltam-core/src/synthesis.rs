//! Memory-synthesis pipeline (§4.6).
//!
//! A five-node state machine sharing one run: threshold gate, event
//! collection, LLM synthesis, atomic persist, and a fire-and-forget
//! auto-knowledge hook. The knowledge-synthesis sub-pipeline it schedules
//! lives at the bottom of this module.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::collaborators::{parse_json_response, Collaborators};
use crate::entities::{
    Anima, Embedding, Event, KnowledgeAction, KnowledgeAuditLog, KnowledgeItem, KnowledgeType, Memory,
};
use crate::error::{CoreError, Result};
use crate::ids::{AnimaId, EventId, KnowledgeId, MemoryId, UserId};
use crate::store::Store;
use crate::tenancy::TenantSession;

/// Minimum accepted length, in characters, for an extracted knowledge
/// item's `content`.
pub const MIN_CONTENT_LEN: usize = 10;
pub const MAX_CONTENT_LEN: usize = 4000;
pub const MIN_SUMMARY_LEN: usize = 5;
pub const MAX_SUMMARY_LEN: usize = 500;
pub const MAX_KNOWLEDGE_ITEMS_PER_MEMORY: usize = 10;
const DEFAULT_TOPIC: &str = "general";

/// Weights and cutoff for the threshold gate's accumulation score.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisThresholds {
    pub time_weight: f64,
    pub event_weight: f64,
    pub token_weight: f64,
    pub threshold: f64,
}

impl Default for SynthesisThresholds {
    /// Tuned so roughly ten events (or four hours of quiet plus a handful
    /// of events) clears the gate; adjust per-anima via a synthesis config
    /// row once one exists.
    fn default() -> Self {
        Self {
            time_weight: 1.0,
            event_weight: 2.0,
            token_weight: 0.01,
            threshold: 10.0,
        }
    }
}

/// What a synthesis run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisOutcome {
    Skipped { reason: &'static str },
    Synthesized { memory_id: MemoryId, source_event_count: usize },
}

fn baseline_fallback() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2000-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
}

/// `max(last_synthesis_check_at, last_memory.created_at, anima.created_at)`,
/// falling back to a fixed epoch if somehow none are available.
fn compute_baseline(anima: &Anima, last_memory_created_at: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let mut candidates = vec![anima.created_at];
    if let Some(check) = anima.last_synthesis_check_at {
        candidates.push(check);
    }
    if let Some(memory_time) = last_memory_created_at {
        candidates.push(memory_time);
    }
    candidates.into_iter().max().unwrap_or_else(baseline_fallback)
}

struct ThresholdGate {
    proceed: bool,
    reason: Option<&'static str>,
    baseline: DateTime<Utc>,
}

fn evaluate_threshold(
    store: &Store,
    anima: &Anima,
    thresholds: &SynthesisThresholds,
    now: DateTime<Utc>,
) -> Result<ThresholdGate> {
    let last_memory_created_at = store.latest_memory_created_at(anima.id)?;
    let baseline = compute_baseline(anima, last_memory_created_at);
    let event_count = store.count_events_since(anima.id, baseline)?;

    if event_count == 0 {
        return Ok(ThresholdGate {
            proceed: false,
            reason: Some("no_events"),
            baseline,
        });
    }

    let hours = (now - baseline).num_milliseconds() as f64 / 1000.0 / 3600.0;
    let token_est = event_count as f64 * 100.0;
    let score =
        thresholds.time_weight * hours + thresholds.event_weight * event_count as f64 + thresholds.token_weight * token_est;

    if score < thresholds.threshold {
        return Ok(ThresholdGate {
            proceed: false,
            reason: Some("below_threshold"),
            baseline,
        });
    }

    Ok(ThresholdGate {
        proceed: true,
        reason: None,
        baseline,
    })
}

#[derive(Debug, serde::Deserialize)]
struct SynthesisDecision {
    summary: String,
    content: String,
    importance: Option<f64>,
    confidence: Option<f64>,
}

fn build_synthesis_prompt(events: &[Event]) -> String {
    let mut lines = String::from(
        "Summarize the following chronological events into one consolidated memory. \
         Respond with a single JSON object: {\"summary\": string, \"content\": string, \
         \"importance\": number 0-1, \"confidence\": number 0-1}.\n\nEvents:\n",
    );
    for event in events {
        let who = event.author.as_deref().or(event.role.as_deref()).unwrap_or("unknown");
        lines.push_str(&format!("- [{}] {}: {}\n", event.occurred_at.to_rfc3339(), who, event.content));
    }
    lines
}

/// Runs one synthesis attempt for `anima_id`. `user_id` is the resolved
/// owner (the caller — typically the scheduler — already did the
/// privileged owner lookup before dispatching here).
pub async fn run_synthesis(
    store: &Arc<Store>,
    collaborators: &Arc<Collaborators>,
    user_id: UserId,
    anima_id: AnimaId,
    thresholds: &SynthesisThresholds,
) -> Result<SynthesisOutcome> {
    let session = TenantSession::new(user_id, store);
    session.check_anima_owned(anima_id)?;
    let now = Utc::now();

    let anima = store.get_anima(anima_id, false)?.ok_or_else(|| CoreError::NotFound {
        kind: "anima",
        id: anima_id.to_string(),
    })?;

    let gate = evaluate_threshold(store, &anima, thresholds, now)?;
    if !gate.proceed {
        let reason = gate.reason.expect("non-proceeding gate always carries a reason");
        if reason == "no_events" {
            // Prevents unbounded time accumulation on an inactive anima.
            store.touch_synthesis_check(anima_id, now)?;
        }
        return Ok(SynthesisOutcome::Skipped { reason });
    }

    let events = store.list_events_since(anima_id, gate.baseline)?;
    if events.is_empty() {
        store.touch_synthesis_check(anima_id, now)?;
        return Ok(SynthesisOutcome::Skipped { reason: "no_events" });
    }

    let prompt = build_synthesis_prompt(&events);
    let raw = collaborators.llm.call(&prompt, 0.3, 800).await?;
    let decision: SynthesisDecision = parse_json_response(&raw)?;

    let time_start = events.iter().map(|e| e.occurred_at).min().expect("events non-empty");
    let time_end = events.iter().map(|e| e.occurred_at).max().expect("events non-empty");

    let mut memory = Memory::new(anima_id, decision.content, decision.summary);
    memory.importance = decision.importance.map(|v| v.clamp(0.0, 1.0));
    memory.confidence = decision.confidence.map(|v| v.clamp(0.0, 1.0));
    memory.time_start = time_start;
    memory.time_end = time_end;

    match collaborators.embedding.embed_text(&memory.summary).await {
        Ok(vector) => memory.embedding = Some(Embedding::new(vector, "default")),
        Err(err) => tracing::warn!(anima = %anima_id, error = %err, "embedding failed during memory synthesis; persisting without a vector"),
    }

    let event_ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
    store.persist_synthesized_memory(&memory, &event_ids)?;
    store.touch_synthesis_check(anima_id, now)?;

    let memory_id = memory.id;
    if collaborators.background_jobs_enabled {
        crate::hooks::trigger_auto_knowledge_synthesis(Arc::clone(store), Arc::clone(collaborators), user_id, memory_id);
    }

    Ok(SynthesisOutcome::Synthesized {
        memory_id,
        source_event_count: events.len(),
    })
}

/// How to reconcile newly-extracted knowledge with anything already
/// derived from the same memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Soft-delete everything previously created from this memory, then
    /// insert the fresh extraction.
    Replace,
    /// Abort without writing anything if knowledge already exists for
    /// this memory.
    Skip,
    /// Always insert, regardless of what already exists.
    Append,
}

#[derive(Debug, serde::Deserialize)]
struct ExtractedKnowledgeItem {
    knowledge_type: Option<String>,
    topic: Option<String>,
    content: String,
    summary: Option<String>,
    confidence: Option<f64>,
}

fn validate_extracted(raw: Vec<ExtractedKnowledgeItem>) -> Vec<(KnowledgeType, Option<String>, String, String, Option<f64>)> {
    let mut valid = Vec::new();
    for item in raw {
        let Some(knowledge_type) = item.knowledge_type.as_deref().and_then(|s| s.parse::<KnowledgeType>().ok()) else {
            continue;
        };
        let content = item.content.trim().to_string();
        if content.chars().count() < MIN_CONTENT_LEN || content.chars().count() > MAX_CONTENT_LEN {
            continue;
        }
        let summary = item
            .summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| content.chars().take(MAX_SUMMARY_LEN).collect());
        if summary.chars().count() < MIN_SUMMARY_LEN {
            continue;
        }
        let summary: String = summary.chars().take(MAX_SUMMARY_LEN).collect();
        let topic = item.topic.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        valid.push((knowledge_type, topic, content, summary, item.confidence));
        if valid.len() >= MAX_KNOWLEDGE_ITEMS_PER_MEMORY {
            break;
        }
    }
    valid
}

fn build_extraction_prompt(memory: &Memory, source_events: &[Event]) -> String {
    let mut prompt = format!(
        "Extract durable, reusable knowledge items from the memory below. Respond with a \
         JSON array, each item: {{\"knowledge_type\": one of FACT|CONCEPT|METHOD|PRINCIPLE|EXPERIENCE, \
         \"topic\": string or null, \"content\": string, \"summary\": string, \"confidence\": number 0-1}}. \
         Return an empty array if nothing durable is worth keeping.\n\nMemory summary: {}\nMemory content: {}\n",
        memory.summary, memory.content
    );
    if !source_events.is_empty() {
        prompt.push_str("\nSource events:\n");
        for event in source_events {
            prompt.push_str(&format!("- {}\n", event.content));
        }
    }
    prompt
}

/// Runs the knowledge-extraction sub-pipeline for `memory_id`: fetch →
/// LLM extraction → validate → persist under `policy`. Returns the ids of
/// every knowledge item created.
pub async fn run_knowledge_synthesis(
    store: &Store,
    collaborators: &Collaborators,
    user_id: UserId,
    memory_id: MemoryId,
    policy: DedupPolicy,
    include_source_events: bool,
) -> Result<Vec<KnowledgeId>> {
    let session = TenantSession::new(user_id, store);
    session.check_memory_owned(memory_id)?;

    let memory = store.get_memory(memory_id, false)?.ok_or_else(|| CoreError::NotFound {
        kind: "memory",
        id: memory_id.to_string(),
    })?;

    let existing_ids = store.find_knowledge_ids_by_source_memory(memory_id)?;
    if policy == DedupPolicy::Skip && !existing_ids.is_empty() {
        return Ok(Vec::new());
    }

    let source_events = if include_source_events {
        store.list_source_events_for_memory(memory_id)?
    } else {
        Vec::new()
    };

    let prompt = build_extraction_prompt(&memory, &source_events);
    let raw = collaborators.llm.call(&prompt, 0.2, 1200).await?;
    let extracted: Vec<ExtractedKnowledgeItem> = parse_json_response(&raw)?;
    let validated = validate_extracted(extracted);

    if validated.is_empty() {
        tracing::warn!(memory = %memory_id, "knowledge extraction yielded no valid items");
        return Ok(Vec::new());
    }

    if policy == DedupPolicy::Replace {
        for knowledge_id in &existing_ids {
            if let Some(mut existing) = store.get_knowledge(*knowledge_id, false)? {
                let before = serde_json::to_value(&existing).ok();
                existing.is_deleted = true;
                existing.updated_at = Utc::now();
                store.save_knowledge(&existing)?;
                let mut log = KnowledgeAuditLog::new(*knowledge_id, KnowledgeAction::Delete, "memory", "memory_synthesis");
                log.source_id = Some(memory_id);
                log.before = before;
                store.create_knowledge_audit_log(&log)?;
            }
        }
    }

    let mut created_ids = Vec::with_capacity(validated.len());
    for (knowledge_type, topic, content, summary, confidence) in validated {
        let mut item = KnowledgeItem::new(memory.anima_id, knowledge_type, content, summary);
        item.topic = topic;
        if let Some(confidence) = confidence {
            item.confidence = confidence.clamp(0.0, 1.0);
        }
        match collaborators.embedding.embed_text(&item.summary).await {
            Ok(vector) => item.embedding = Some(Embedding::new(vector, "default")),
            Err(err) => tracing::warn!(memory = %memory_id, error = %err, "embedding failed during knowledge synthesis"),
        }

        store.create_knowledge(&item)?;
        let mut log = KnowledgeAuditLog::new(item.id, KnowledgeAction::Create, "memory", "memory_synthesis");
        log.source_id = Some(memory_id);
        log.after = serde_json::to_value(&item).ok();
        store.create_knowledge_audit_log(&log)?;

        created_ids.push(item.id);
    }

    Ok(created_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::{DeterministicEmbeddingClient, ScriptedLlmClient};
    use crate::entities::{Anima, EventType};
    use crate::ids::OrganizationId;

    fn seed_collaborators(responses: Vec<String>) -> Collaborators {
        Collaborators {
            embedding: Arc::new(DeterministicEmbeddingClient::default()),
            llm: Arc::new(ScriptedLlmClient::in_order(responses)),
            background_jobs_enabled: false,
        }
    }

    fn seed_event(anima_id: AnimaId, content: &str) -> Event {
        let mut event = Event::new(anima_id, EventType::MessageIn, content);
        event.occurred_at = Utc::now();
        event
    }

    #[tokio::test]
    async fn threshold_gate_skips_with_no_events() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();
        let collaborators = Arc::new(seed_collaborators(vec![]));

        let outcome = run_synthesis(&store, &collaborators, anima.user_id, anima.id, &SynthesisThresholds::default())
            .await
            .unwrap();
        assert_eq!(outcome, SynthesisOutcome::Skipped { reason: "no_events" });

        let refreshed = store.get_anima(anima.id, false).unwrap().unwrap();
        assert!(refreshed.last_synthesis_check_at.is_some());
    }

    #[tokio::test]
    async fn threshold_gate_skips_below_threshold() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();
        store.create_event(&seed_event(anima.id, "hello")).unwrap();

        let collaborators = Arc::new(seed_collaborators(vec![]));
        let thresholds = SynthesisThresholds {
            threshold: 1_000_000.0,
            ..SynthesisThresholds::default()
        };

        let outcome = run_synthesis(&store, &collaborators, anima.user_id, anima.id, &thresholds).await.unwrap();
        assert_eq!(outcome, SynthesisOutcome::Skipped { reason: "below_threshold" });
    }

    #[tokio::test]
    async fn synthesis_persists_memory_and_links_events() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();
        for i in 0..5 {
            store.create_event(&seed_event(anima.id, &format!("message {i}"))).unwrap();
        }

        let llm_response = r#"{"summary": "discussed plans", "content": "detailed plan discussion", "importance": 0.7, "confidence": 0.8}"#;
        let collaborators = Arc::new(seed_collaborators(vec![llm_response.to_string()]));
        let thresholds = SynthesisThresholds {
            threshold: 0.0,
            ..SynthesisThresholds::default()
        };

        let outcome = run_synthesis(&store, &collaborators, anima.user_id, anima.id, &thresholds).await.unwrap();
        let SynthesisOutcome::Synthesized { memory_id, source_event_count } = outcome else {
            panic!("expected synthesis to proceed");
        };
        assert_eq!(source_event_count, 5);

        let memory = store.get_memory(memory_id, false).unwrap().unwrap();
        assert_eq!(memory.summary, "discussed plans");
        let links = store.list_memory_events_for_memory(memory_id).unwrap();
        assert_eq!(links.len(), 5);
    }

    #[tokio::test]
    async fn knowledge_synthesis_persists_validated_items() {
        let store = Store::open_in_memory().unwrap();
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();
        let memory = Memory::new(anima.id, "long form content about rust ownership", "rust ownership notes");
        store.create_memory(&memory).unwrap();

        let extraction = r#"[
            {"knowledge_type": "FACT", "topic": "rust", "content": "Ownership rules prevent use-after-free.", "summary": "Ownership prevents UAF", "confidence": 0.9},
            {"knowledge_type": "BOGUS", "content": "short", "summary": "x"}
        ]"#;
        let collaborators = seed_collaborators(vec![extraction.to_string()]);

        let ids = run_knowledge_synthesis(&store, &collaborators, anima.user_id, memory.id, DedupPolicy::Append, false)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let item = store.get_knowledge(ids[0], false).unwrap().unwrap();
        assert_eq!(item.topic.as_deref(), Some("rust"));
        let audit = store.list_knowledge_audit_log(ids[0]).unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn knowledge_synthesis_skip_policy_aborts_when_existing() {
        let store = Store::open_in_memory().unwrap();
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();
        let memory = Memory::new(anima.id, "content", "summary");
        store.create_memory(&memory).unwrap();

        let mut existing = KnowledgeItem::new(anima.id, KnowledgeType::Fact, "pre-existing content here", "pre-existing");
        store.create_knowledge(&existing).unwrap();
        let mut log = KnowledgeAuditLog::new(existing.id, KnowledgeAction::Create, "memory", "memory_synthesis");
        log.source_id = Some(memory.id);
        store.create_knowledge_audit_log(&log).unwrap();
        existing.confidence = 0.6;
        store.save_knowledge(&existing).unwrap();

        let collaborators = seed_collaborators(vec![]);
        let ids = run_knowledge_synthesis(&store, &collaborators, anima.user_id, memory.id, DedupPolicy::Skip, false)
            .await
            .unwrap();
        assert!(ids.is_empty());
    }
}
