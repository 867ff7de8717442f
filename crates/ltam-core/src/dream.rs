//! Dream curation engine (§4.7).
//!
//! One dream cycle gathers an anima's state, runs an algorithmic
//! light-sleep pass (decay update, state transitions, merge-candidate
//! detection, review flagging), then a deep-sleep pass that hands
//! merge/review decisions to the LLM collaborator. Every mutation routes
//! through [`record_action`], which writes a [`DreamAction`] row and bumps
//! the owning [`DreamSession`]'s counters in the same step (§4.7's "action
//! audit invariant").
//!
//! Concurrency is guarded twice: an in-process set of anima ids currently
//! dreaming (checked by [`crate::scheduler`] callers before invoking this
//! module) and the database row check in [`has_running_dream_session`]
//! below, which survives process restarts.

use std::sync::Arc;

use chrono::Utc;

use crate::collaborators::{parse_json_response, Collaborators};
use crate::entities::{
    ActionType, Anima, DreamAction, DreamPhase, DreamSession, DreamStatus, DreamTrigger, Embedding, IdentitySelfModel,
    KnowledgeItem, Memory, MemoryState,
};
use crate::error::{CoreError, Result};
use crate::ids::{AnimaId, DreamSessionId, MemoryId, UserId};
use crate::scoring;
use crate::store::Store;
use crate::tenancy::TenantSession;

/// Named thresholds driving the light-sleep algorithm. The
/// `embedding_similarity_threshold`/`jaccard_similarity_threshold` pair
/// feeds merge-candidate detection; the rest feed decay/state transitions
/// and review flagging.
#[derive(Debug, Clone, Copy)]
pub struct DreamConfig {
    pub decay_half_life_days: f64,
    pub decay_threshold: f64,
    pub importance_floor: f64,
    pub archive_threshold: f64,
    pub embedding_similarity_threshold: f32,
    pub jaccard_similarity_threshold: f64,
    pub confidence_review_threshold: f64,
    pub min_summary_length: usize,
    pub curation_batch_size: usize,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self {
            decay_half_life_days: 30.0,
            decay_threshold: 0.7,
            importance_floor: 0.4,
            archive_threshold: 0.9,
            embedding_similarity_threshold: 0.85,
            jaccard_similarity_threshold: 0.6,
            confidence_review_threshold: 0.4,
            min_summary_length: 20,
            curation_batch_size: 5,
        }
    }
}

/// Minutes after which a `RUNNING` session is considered abandoned and
/// swept by [`sweep_stale_sessions`] (§4.7, §5).
pub const STALE_SESSION_THRESHOLD_MINUTES: i64 = 60;

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

fn word_set(text: &str) -> std::collections::HashSet<String> {
    text.to_lowercase().split_whitespace().map(str::to_string).collect()
}

fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let sa = word_set(a);
    let sb = word_set(b);
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Writes a [`DreamAction`] and bumps `session`'s counters per the per-type
/// rule in §4.7: `MERGE` → `created += 1, modified += len(sources)`;
/// `SPLIT` → `created += len(results), modified += 1`; `UPDATE` →
/// `modified += 1`; `ARCHIVE` → `archived += 1`; `DELETE` → `deleted += 1`.
fn record_action(
    store: &Store,
    session: &mut DreamSession,
    action_type: ActionType,
    phase: DreamPhase,
    source_memory_ids: Vec<MemoryId>,
    result_memory_ids: Option<Vec<MemoryId>>,
    before_state: serde_json::Value,
    after_state: Option<serde_json::Value>,
    reasoning: Option<String>,
) -> Result<()> {
    debug_assert!(!source_memory_ids.is_empty(), "every action carries at least one source memory");
    if action_type == ActionType::Delete {
        debug_assert!(result_memory_ids.is_none(), "DELETE carries no result memories");
    }

    let action = DreamAction {
        id: crate::ids::DreamActionId::new(),
        session_id: session.id,
        action_type,
        phase,
        source_memory_ids: source_memory_ids.clone(),
        result_memory_ids: result_memory_ids.clone(),
        before_state,
        after_state,
        reasoning,
        created_at: Utc::now(),
    };
    store.create_dream_action(&action)?;

    match action_type {
        ActionType::Merge => {
            session.memories_created += 1;
            session.memories_modified += source_memory_ids.len() as u32;
        }
        ActionType::Split => {
            session.memories_created += result_memory_ids.map(|r| r.len()).unwrap_or(0) as u32;
            session.memories_modified += 1;
        }
        ActionType::Update => session.memories_modified += 1,
        ActionType::Archive => session.memories_archived += 1,
        ActionType::Delete => session.memories_deleted += 1,
    }
    Ok(())
}

/// Starts a `RUNNING` [`DreamSession`] for `anima_id`, refusing if the
/// database already shows one running (409 semantics at the caller's
/// boundary). The in-process per-workflow guard described in §4.7 lives in
/// [`crate::scheduler`]; this is the durable half of the "belt and
/// suspenders" check.
pub fn start_session(
    store: &Store,
    user_id: UserId,
    anima_id: AnimaId,
    trigger: DreamTrigger,
    triggered_by_user_id: Option<UserId>,
) -> Result<DreamSession> {
    let session_guard = TenantSession::new(user_id, store);
    session_guard.check_anima_owned(anima_id)?;

    if store.has_running_dream_session(anima_id)? {
        return Err(CoreError::Duplicate {
            kind: "dream_session",
            detail: format!("anima {anima_id} already has a running dream session"),
        });
    }

    let mut session = DreamSession::start(anima_id, trigger, triggered_by_user_id);
    session.config_snapshot = serde_json::to_value(ConfigSnapshot::from(DreamConfig::default())).unwrap_or_default();
    store.create_dream_session(&session)?;
    Ok(session)
}

#[derive(Debug, serde::Serialize)]
struct ConfigSnapshot {
    decay_half_life_days: f64,
    decay_threshold: f64,
    importance_floor: f64,
    archive_threshold: f64,
    embedding_similarity_threshold: f32,
    jaccard_similarity_threshold: f64,
    confidence_review_threshold: f64,
    min_summary_length: usize,
    curation_batch_size: usize,
}

impl From<DreamConfig> for ConfigSnapshot {
    fn from(c: DreamConfig) -> Self {
        Self {
            decay_half_life_days: c.decay_half_life_days,
            decay_threshold: c.decay_threshold,
            importance_floor: c.importance_floor,
            archive_threshold: c.archive_threshold,
            embedding_similarity_threshold: c.embedding_similarity_threshold,
            jaccard_similarity_threshold: c.jaccard_similarity_threshold,
            confidence_review_threshold: c.confidence_review_threshold,
            min_summary_length: c.min_summary_length,
            curation_batch_size: c.curation_batch_size,
        }
    }
}

/// Marks every `RUNNING` session older than [`STALE_SESSION_THRESHOLD_MINUTES`]
/// as `FAILED`, so a crashed or orphaned run can't permanently block its
/// anima's concurrency guard. Runs before each scheduled dream sweep.
pub fn sweep_stale_sessions(store: &Store) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::minutes(STALE_SESSION_THRESHOLD_MINUTES);
    let stale = store.list_stale_running_sessions(cutoff)?;
    let count = stale.len() as u64;
    for mut session in stale {
        session.status = DreamStatus::Failed;
        session.completed_at = Some(Utc::now());
        session.error_message = Some("stale session swept by scheduler".to_string());
        store.save_dream_session(&session)?;
    }
    Ok(count)
}

/// Marks a `RUNNING` session `FAILED` with "Cancelled by user". Advisory
/// only (§5): a run already past this check in-process won't notice.
pub fn cancel_session(store: &Store, user_id: UserId, anima_id: AnimaId, session_id: DreamSessionId) -> Result<DreamSession> {
    let tenant = TenantSession::new(user_id, store);
    tenant.check_anima_owned(anima_id)?;

    let mut session = store.get_dream_session(session_id)?.ok_or_else(|| CoreError::NotFound {
        kind: "dream_session",
        id: session_id.to_string(),
    })?;
    if session.anima_id != anima_id {
        return Err(CoreError::NotFound {
            kind: "dream_session",
            id: session_id.to_string(),
        });
    }
    if session.status != DreamStatus::Running {
        return Err(CoreError::Validation(format!("dream session {session_id} is not running")));
    }

    session.status = DreamStatus::Failed;
    session.completed_at = Some(Utc::now());
    session.error_message = Some("Cancelled by user".to_string());
    store.save_dream_session(&session)?;
    Ok(session)
}

struct Gathered {
    anima: Anima,
    active_memories: Vec<Memory>,
    recent_memory_ids: std::collections::HashSet<MemoryId>,
    #[allow(dead_code)]
    identity: Option<IdentitySelfModel>,
    #[allow(dead_code)]
    knowledge: Vec<KnowledgeItem>,
}

fn gather(store: &Store, anima_id: AnimaId) -> Result<Gathered> {
    let anima = store.get_anima(anima_id, false)?.ok_or_else(|| CoreError::NotFound {
        kind: "anima",
        id: anima_id.to_string(),
    })?;
    let active_memories = store.list_active_memories(anima_id)?;
    let identity = store.get_identity(anima_id)?;
    let knowledge = store.list_knowledge(anima_id, None, false, 1000)?;

    let previous_completion = store.most_recent_completed_dream(anima_id)?.and_then(|s| s.completed_at);
    let recent_memory_ids: std::collections::HashSet<MemoryId> = match previous_completion {
        Some(completed_at) => active_memories
            .iter()
            .filter(|m| m.created_at > completed_at)
            .map(|m| m.id)
            .collect(),
        None => active_memories.iter().map(|m| m.id).collect(),
    };

    Ok(Gathered {
        anima,
        active_memories,
        recent_memory_ids,
        identity,
        knowledge,
    })
}

/// A group of mutually-similar memories worth offering to the LLM as a
/// merge candidate.
#[derive(Debug, Clone)]
struct MergeCandidate {
    memories: Vec<Memory>,
}

struct LightSleepResult {
    /// Memories surviving light sleep (post decay/transition, re-fetched),
    /// keyed by id for the deep-sleep pass to look up current state.
    memories: std::collections::HashMap<MemoryId, Memory>,
    merge_candidates: Vec<MergeCandidate>,
    review_flagged: std::collections::HashSet<MemoryId>,
}

/// The algorithmic light-sleep pass (§4.7): decay update, state
/// transitions, merge-candidate detection, review flagging. No LLM calls.
fn run_light_sleep(store: &Store, session: &mut DreamSession, gathered: &Gathered, config: &DreamConfig) -> Result<LightSleepResult> {
    let now = Utc::now();
    let mut memories = std::collections::HashMap::new();

    for memory in &gathered.active_memories {
        session.memories_reviewed += 1;
        let mut memory = memory.clone();

        // 1. Decay update: §4.7's own linear formula, distinct from the
        // exponential spaced-repetition `decay()` primitive in `scoring`
        // (that one is for retrieval-time scoring, not this cycle's
        // bookkeeping update).
        let new_recency = scoring::recency(memory.updated_at, now, config.decay_half_life_days);
        let age_days = (now - memory.updated_at).num_milliseconds() as f64 / 1000.0 / 86_400.0;
        let new_decay = (age_days.max(0.0) / config.decay_half_life_days).min(1.0);
        let old_decay = memory.decay_score.unwrap_or(0.0);
        if (new_decay - old_decay).abs() > 0.01 {
            let before = serde_json::to_value(&memory).ok().unwrap_or_default();
            memory.recency_score = Some(new_recency);
            memory.decay_score = Some(new_decay);
            memory.updated_at = now;
            store.save_memory(&memory)?;
            let after = serde_json::to_value(&memory).ok();
            record_action(
                store,
                session,
                ActionType::Update,
                DreamPhase::LightSleep,
                vec![memory.id],
                None,
                before,
                after,
                None,
            )?;
        }

        // 2. State transition.
        let importance = memory.importance.unwrap_or(0.5);
        let decay = memory.decay_score.unwrap_or(0.0);
        let before_state = memory.state;
        let new_state = match before_state {
            MemoryState::Active if decay > config.decay_threshold && importance < config.importance_floor => {
                Some(MemoryState::Decaying)
            }
            MemoryState::Decaying if decay > config.archive_threshold => Some(MemoryState::Archived),
            _ => None,
        };
        if let Some(new_state) = new_state {
            let before = serde_json::to_value(&memory).ok().unwrap_or_default();
            memory.state = new_state;
            memory.updated_at = now;
            store.save_memory(&memory)?;
            let after = serde_json::to_value(&memory).ok();
            record_action(
                store,
                session,
                ActionType::Archive,
                DreamPhase::LightSleep,
                vec![memory.id],
                None,
                before,
                after,
                None,
            )?;
        }

        memories.insert(memory.id, memory);
    }

    // 3. Merge-candidate detection: only memories still `active` or
    // `decaying` are worth proposing for a merge.
    let mut processed: std::collections::HashSet<MemoryId> = std::collections::HashSet::new();
    let mut merge_candidates = Vec::new();
    let candidates: Vec<&Memory> = memories
        .values()
        .filter(|m| matches!(m.state, MemoryState::Active | MemoryState::Decaying))
        .collect();

    for anchor in &candidates {
        if processed.contains(&anchor.id) {
            continue;
        }
        let mut group = vec![(*anchor).clone()];
        for other in &candidates {
            if other.id == anchor.id || processed.contains(&other.id) {
                continue;
            }
            let similar = match (&anchor.embedding, &other.embedding) {
                (Some(a), Some(b)) => cosine_similarity(&a.vector, &b.vector) >= config.embedding_similarity_threshold,
                _ => jaccard_similarity(&anchor.summary, &other.summary) >= config.jaccard_similarity_threshold,
            };
            if similar {
                group.push((*other).clone());
            }
        }
        if group.len() >= 2 {
            for m in &group {
                processed.insert(m.id);
            }
            merge_candidates.push(MergeCandidate { memories: group });
        } else {
            processed.insert(anchor.id);
        }
    }

    // 4. Review flags: low-confidence, very short summary, or recent.
    let mut review_flagged = std::collections::HashSet::new();
    for memory in memories.values() {
        let low_confidence = memory.confidence.map(|c| c < config.confidence_review_threshold).unwrap_or(false);
        let too_short = memory.summary.chars().count() < config.min_summary_length;
        let recent = gathered.recent_memory_ids.contains(&memory.id);
        if low_confidence || too_short || recent {
            review_flagged.insert(memory.id);
        }
    }

    Ok(LightSleepResult {
        memories,
        merge_candidates,
        review_flagged,
    })
}

#[derive(Debug, serde::Deserialize)]
struct MergeDecision {
    should_merge: bool,
    merged_summary: Option<String>,
    importance: Option<f64>,
    confidence: Option<f64>,
    reasoning: Option<String>,
}

fn build_merge_prompt(memories: &[Memory]) -> String {
    let mut prompt = String::from(
        "The following memories may describe the same underlying experience. Decide whether \
         to merge them into one. Respond with a single JSON object: {\"should_merge\": bool, \
         \"merged_summary\": string, \"importance\": number 0-1, \"confidence\": number 0-1, \
         \"reasoning\": string}.\n\nMemories:\n",
    );
    for memory in memories {
        prompt.push_str(&format!("- {}\n", memory.summary));
    }
    prompt
}

/// Merges `sources` (≥ 2, same anima) into one new memory: concatenates
/// non-empty contents with a visible separator, spans `[min(time_start),
/// max(time_end)]`, records `merged_from` provenance, then soft-deletes
/// every source (their event links are preserved). Regenerates an
/// embedding on the merged memory.
async fn merge_memories(
    store: &Store,
    collaborators: &Collaborators,
    sources: &[Memory],
    summary: String,
    importance: Option<f64>,
    confidence: Option<f64>,
) -> Result<Memory> {
    if sources.len() < 2 {
        return Err(CoreError::Validation("merge requires at least two source memories".to_string()));
    }
    let anima_id = sources[0].anima_id;

    let content = sources
        .iter()
        .map(|m| m.content.as_str())
        .filter(|c| !c.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n---\n");

    let time_start = sources.iter().map(|m| m.time_start).min().expect("sources non-empty");
    let time_end = sources.iter().map(|m| m.time_end).max().expect("sources non-empty");

    let mut merged = Memory::new(anima_id, content, summary);
    merged.importance = importance.map(|v| v.clamp(0.0, 1.0));
    merged.confidence = confidence.map(|v| v.clamp(0.0, 1.0));
    merged.time_start = time_start;
    merged.time_end = time_end;
    merged.metadata = serde_json::json!({ "merged_from": sources.iter().map(|m| m.id.to_string()).collect::<Vec<_>>() });

    match collaborators.embedding.embed_text(&merged.summary).await {
        Ok(vector) => merged.embedding = Some(Embedding::new(vector, "default")),
        Err(err) => tracing::warn!(anima = %anima_id, error = %err, "embedding failed while merging memories"),
    }

    store.create_memory(&merged)?;
    for source in sources {
        let mut source = source.clone();
        source.is_deleted = true;
        source.updated_at = Utc::now();
        store.save_memory(&source)?;
    }

    Ok(merged)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReviewAction {
    Keep,
    Update,
    Split,
    Delete,
}

impl std::str::FromStr for ReviewAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "KEEP" => Ok(ReviewAction::Keep),
            "UPDATE" => Ok(ReviewAction::Update),
            "SPLIT" => Ok(ReviewAction::Split),
            "DELETE" => Ok(ReviewAction::Delete),
            other => Err(format!("unknown review action: {other}")),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ReviewDecisionRaw {
    index: usize,
    action: String,
    new_summary: Option<String>,
    new_importance: Option<f64>,
    new_confidence: Option<f64>,
    split_into: Option<Vec<String>>,
    reasoning: Option<String>,
}

fn build_review_prompt(batch: &[&Memory]) -> String {
    let mut prompt = String::from(
        "Review the following memories and decide, for each, whether to keep it as-is, update \
         its summary/scores, split it into multiple memories, or delete it. Respond with a JSON \
         array, each item: {\"index\": integer, \"action\": one of KEEP|UPDATE|SPLIT|DELETE, \
         \"new_summary\": string or null, \"new_importance\": number or null, \"new_confidence\": \
         number or null, \"split_into\": array of strings or null (required for SPLIT, at least \
         two entries), \"reasoning\": string}.\n\nMemories:\n",
    );
    for (i, memory) in batch.iter().enumerate() {
        prompt.push_str(&format!(
            "{i}. summary=\"{}\" importance={:?} confidence={:?}\n",
            memory.summary, memory.importance, memory.confidence
        ));
    }
    prompt
}

/// The deep-sleep pass (§4.7): for each merge-candidate group, ask the LLM
/// whether to merge; for each flagged-review memory not already merged,
/// batch and ask the LLM to keep/update/split/delete.
async fn run_deep_sleep(
    store: &Store,
    collaborators: &Collaborators,
    session: &mut DreamSession,
    light_sleep: LightSleepResult,
    config: &DreamConfig,
) -> Result<()> {
    let mut merged_ids: std::collections::HashSet<MemoryId> = std::collections::HashSet::new();

    for candidate in &light_sleep.merge_candidates {
        if candidate.memories.len() < 2 {
            continue;
        }
        let prompt = build_merge_prompt(&candidate.memories);
        let raw = match collaborators.llm.call(&prompt, 0.3, 500).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "merge prompt failed; leaving candidates untouched");
                continue;
            }
        };
        let decision: MergeDecision = match parse_json_response(&raw) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable merge decision; leaving candidates untouched");
                continue;
            }
        };
        if !decision.should_merge {
            continue;
        }
        let Some(summary) = decision.merged_summary else {
            continue;
        };

        let before = serde_json::to_value(&candidate.memories).ok().unwrap_or_default();
        let merged = merge_memories(store, collaborators, &candidate.memories, summary, decision.importance, decision.confidence).await?;
        let after = serde_json::to_value(&merged).ok();

        for m in &candidate.memories {
            merged_ids.insert(m.id);
        }

        record_action(
            store,
            session,
            ActionType::Merge,
            DreamPhase::DeepSleep,
            candidate.memories.iter().map(|m| m.id).collect(),
            Some(vec![merged.id]),
            before,
            after,
            decision.reasoning,
        )?;
    }

    let review_targets: Vec<&Memory> = light_sleep
        .review_flagged
        .iter()
        .filter(|id| !merged_ids.contains(id))
        .filter_map(|id| light_sleep.memories.get(id))
        .collect();

    for batch in review_targets.chunks(config.curation_batch_size) {
        let prompt = build_review_prompt(batch);
        let raw = match collaborators.llm.call(&prompt, 0.3, 800).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "review prompt failed; leaving batch untouched");
                continue;
            }
        };
        let decisions: Vec<ReviewDecisionRaw> = match parse_json_response(&raw) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable review decisions; leaving batch untouched");
                continue;
            }
        };

        for raw_decision in decisions {
            let Some(memory) = batch.get(raw_decision.index) else { continue };
            let Ok(action) = raw_decision.action.parse::<ReviewAction>() else { continue };

            match action {
                ReviewAction::Keep => {}
                ReviewAction::Update => {
                    let mut updated = (*memory).clone();
                    let before = serde_json::to_value(&updated).ok().unwrap_or_default();
                    if let Some(summary) = raw_decision.new_summary {
                        updated.summary = summary;
                    }
                    if let Some(importance) = raw_decision.new_importance {
                        updated.importance = Some(importance.clamp(0.0, 1.0));
                    }
                    if let Some(confidence) = raw_decision.new_confidence {
                        updated.confidence = Some(confidence.clamp(0.0, 1.0));
                    }
                    updated.updated_at = Utc::now();
                    if updated.summary != memory.summary {
                        match collaborators.embedding.embed_text(&updated.summary).await {
                            Ok(vector) => updated.embedding = Some(Embedding::new(vector, "default")),
                            Err(err) => tracing::warn!(error = %err, "embedding failed during review update"),
                        }
                    }
                    store.save_memory(&updated)?;
                    let after = serde_json::to_value(&updated).ok();
                    record_action(
                        store,
                        session,
                        ActionType::Update,
                        DreamPhase::DeepSleep,
                        vec![updated.id],
                        None,
                        before,
                        after,
                        raw_decision.reasoning,
                    )?;
                }
                ReviewAction::Split => {
                    let Some(summaries) = raw_decision.split_into else { continue };
                    if summaries.len() < 2 {
                        continue;
                    }
                    let before = serde_json::to_value(memory).ok().unwrap_or_default();
                    let mut result_ids = Vec::with_capacity(summaries.len());
                    let mut results = Vec::with_capacity(summaries.len());
                    for summary in &summaries {
                        let mut split = Memory::new(memory.anima_id, memory.content.clone(), summary.clone());
                        split.importance = memory.importance;
                        split.confidence = memory.confidence;
                        split.time_start = memory.time_start;
                        split.time_end = memory.time_end;
                        split.metadata = serde_json::json!({ "split_from": memory.id.to_string() });
                        match collaborators.embedding.embed_text(summary).await {
                            Ok(vector) => split.embedding = Some(Embedding::new(vector, "default")),
                            Err(err) => tracing::warn!(error = %err, "embedding failed during split"),
                        }
                        store.create_memory(&split)?;
                        result_ids.push(split.id);
                        results.push(split);
                    }

                    let mut source = (*memory).clone();
                    source.is_deleted = true;
                    source.updated_at = Utc::now();
                    store.save_memory(&source)?;

                    let after = serde_json::to_value(&results).ok();
                    record_action(
                        store,
                        session,
                        ActionType::Split,
                        DreamPhase::DeepSleep,
                        vec![memory.id],
                        Some(result_ids),
                        before,
                        after,
                        raw_decision.reasoning,
                    )?;
                }
                ReviewAction::Delete => {
                    let before = serde_json::to_value(memory).ok().unwrap_or_default();
                    let mut deleted = (*memory).clone();
                    deleted.is_deleted = true;
                    deleted.updated_at = Utc::now();
                    store.save_memory(&deleted)?;
                    record_action(
                        store,
                        session,
                        ActionType::Delete,
                        DreamPhase::DeepSleep,
                        vec![memory.id],
                        None,
                        before,
                        None,
                        raw_decision.reasoning,
                    )?;
                }
            }
        }
    }

    Ok(())
}

/// Builds the human-readable summary from a session's final, non-zero
/// counters (§4.7).
fn build_summary(session: &DreamSession) -> String {
    let mut parts = Vec::new();
    if session.memories_created > 0 {
        parts.push(format!("created {}", session.memories_created));
    }
    if session.memories_modified > 0 {
        parts.push(format!("modified {}", session.memories_modified));
    }
    if session.memories_archived > 0 {
        parts.push(format!("archived {}", session.memories_archived));
    }
    if session.memories_deleted > 0 {
        parts.push(format!("deleted {}", session.memories_deleted));
    }
    if parts.is_empty() {
        format!("Reviewed {} memories; no changes were necessary.", session.memories_reviewed)
    } else {
        format!("Reviewed {} memories: {}.", session.memories_reviewed, parts.join(", "))
    }
}

/// Runs one dream cycle for `anima_id` against an already-`RUNNING`
/// `session` (created by [`start_session`]). On success, `session` becomes
/// `COMPLETED` with final counters and a summary; on any internal error,
/// the session is marked `FAILED` with the error message captured in a
/// fresh connection (the in-flight session's own mutations, if any failed
/// mid-way, are each already durable — per-action writes, not one
/// encompassing transaction, so nothing needs to be rolled back here).
pub async fn run_dream(
    store: &Arc<Store>,
    collaborators: &Arc<Collaborators>,
    user_id: UserId,
    anima_id: AnimaId,
    mut session: DreamSession,
    config: DreamConfig,
) -> Result<DreamSession> {
    let tenant = TenantSession::new(user_id, store);
    if let Err(err) = tenant.check_anima_owned(anima_id) {
        fail_session(store, session.id, &err.to_string())?;
        return Err(err);
    }

    match run_dream_inner(store, collaborators, &mut session, anima_id, &config).await {
        Ok(()) => {
            session.status = DreamStatus::Completed;
            session.completed_at = Some(Utc::now());
            session.summary = Some(build_summary(&session));
            store.save_dream_session(&session)?;
            Ok(session)
        }
        Err(err) => {
            fail_session(store, session.id, &err.to_string())?;
            Err(err)
        }
    }
}

async fn run_dream_inner(
    store: &Store,
    collaborators: &Collaborators,
    session: &mut DreamSession,
    anima_id: AnimaId,
    config: &DreamConfig,
) -> Result<()> {
    let gathered = gather(store, anima_id)?;
    if gathered.anima.is_dormant {
        tracing::debug!(anima = %anima_id, "skipping dream cycle for dormant anima");
        return Ok(());
    }
    let light_sleep = run_light_sleep(store, session, &gathered, config)?;
    run_deep_sleep(store, collaborators, session, light_sleep, config).await?;
    Ok(())
}

fn fail_session(store: &Store, session_id: DreamSessionId, error_message: &str) -> Result<()> {
    if let Some(mut session) = store.get_dream_session(session_id)? {
        session.status = DreamStatus::Failed;
        session.completed_at = Some(Utc::now());
        session.error_message = Some(error_message.to_string());
        store.save_dream_session(&session)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::{DeterministicEmbeddingClient, ScriptedLlmClient};
    use crate::entities::Anima;
    use crate::ids::OrganizationId;

    fn collaborators(responses: Vec<String>) -> Arc<Collaborators> {
        Arc::new(Collaborators {
            embedding: Arc::new(DeterministicEmbeddingClient::default()),
            llm: Arc::new(ScriptedLlmClient::in_order(responses)),
            background_jobs_enabled: false,
        })
    }

    #[test]
    fn start_session_rejects_second_concurrent_run() {
        let store = Store::open_in_memory().unwrap();
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        start_session(&store, anima.user_id, anima.id, DreamTrigger::Manual, None).unwrap();
        let second = start_session(&store, anima.user_id, anima.id, DreamTrigger::Manual, None);
        assert!(matches!(second, Err(CoreError::Duplicate { kind: "dream_session", .. })));
    }

    #[test]
    fn sweep_stale_sessions_fails_old_running_sessions() {
        let store = Store::open_in_memory().unwrap();
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let mut session = DreamSession::start(anima.id, DreamTrigger::Manual, None);
        session.started_at = Utc::now() - chrono::Duration::minutes(STALE_SESSION_THRESHOLD_MINUTES + 5);
        store.create_dream_session(&session).unwrap();

        let swept = sweep_stale_sessions(&store).unwrap();
        assert_eq!(swept, 1);

        let refreshed = store.get_dream_session(session.id).unwrap().unwrap();
        assert_eq!(refreshed.status, DreamStatus::Failed);
    }

    #[tokio::test]
    async fn light_sleep_transitions_low_importance_high_decay_memory() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let mut memory = Memory::new(anima.id, "content", "a summary long enough to skip review flags easily");
        memory.importance = Some(0.1);
        memory.decay_score = Some(0.5);
        memory.updated_at = Utc::now() - chrono::Duration::days(60);
        memory.confidence = Some(0.9);
        store.create_memory(&memory).unwrap();

        let session = start_session(&store, anima.user_id, anima.id, DreamTrigger::Manual, None).unwrap();
        let collaborators = collaborators(vec![]);
        let result = run_dream(&store, &collaborators, anima.user_id, anima.id, session, DreamConfig::default())
            .await
            .unwrap();

        assert_eq!(result.status, DreamStatus::Completed);
        assert_eq!(result.memories_archived, 1);

        let refreshed = store.get_memory(memory.id, false).unwrap().unwrap();
        assert_eq!(refreshed.state, MemoryState::Decaying);
    }

    #[tokio::test]
    async fn deep_sleep_merges_similar_memories_and_soft_deletes_sources() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let embedding = DeterministicEmbeddingClient::default();
        let shared_vector = embedding.embed_text("shared topic").await.unwrap();

        let mut m1 = Memory::new(anima.id, "content one", "summary one, long enough to avoid review flags");
        m1.embedding = Some(Embedding::new(shared_vector.clone(), "default"));
        m1.confidence = Some(0.9);
        store.create_memory(&m1).unwrap();

        let mut m2 = Memory::new(anima.id, "content two", "summary two, long enough to avoid review flags");
        m2.embedding = Some(Embedding::new(shared_vector, "default"));
        m2.confidence = Some(0.9);
        store.create_memory(&m2).unwrap();

        let merge_response = r#"{"should_merge": true, "merged_summary": "merged summary", "importance": 0.6, "confidence": 0.8, "reasoning": "duplicate experiences"}"#;
        let collaborators = collaborators(vec![merge_response.to_string()]);

        let session = start_session(&store, anima.user_id, anima.id, DreamTrigger::Manual, None).unwrap();
        let result = run_dream(&store, &collaborators, anima.user_id, anima.id, session, DreamConfig::default())
            .await
            .unwrap();

        assert_eq!(result.status, DreamStatus::Completed);
        assert_eq!(result.memories_created, 1);
        assert_eq!(result.memories_modified, 2);

        let actions = store.list_dream_actions(result.id).unwrap();
        let merges: Vec<_> = actions.iter().filter(|a| a.action_type == ActionType::Merge).collect();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].source_memory_ids.len(), 2);
        assert_eq!(merges[0].result_memory_ids.as_ref().map(Vec::len), Some(1));

        let source_1 = store.get_memory(m1.id, true).unwrap().unwrap();
        let source_2 = store.get_memory(m2.id, true).unwrap().unwrap();
        assert!(source_1.is_deleted);
        assert!(source_2.is_deleted);

        let merged_id = merges[0].result_memory_ids.as_ref().unwrap()[0];
        let merged = store.get_memory(merged_id, false).unwrap().unwrap();
        assert_eq!(merged.merged_from(), vec![m1.id, m2.id]);
    }

    #[tokio::test]
    async fn run_dream_failure_marks_session_failed() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let session = start_session(&store, anima.user_id, anima.id, DreamTrigger::Manual, None).unwrap();
        let other_user = UserId::new();
        let collaborators = collaborators(vec![]);

        let result = run_dream(&store, &collaborators, other_user, anima.id, session.clone(), DreamConfig::default()).await;
        assert!(result.is_err());

        let refreshed = store.get_dream_session(session.id).unwrap().unwrap();
        assert_eq!(refreshed.status, DreamStatus::Failed);
    }

    #[test]
    fn jaccard_similarity_identical_is_one() {
        assert!((jaccard_similarity("the quick fox", "the quick fox") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn jaccard_similarity_disjoint_is_zero() {
        assert_eq!(jaccard_similarity("alpha beta", "gamma delta"), 0.0);
    }
}
