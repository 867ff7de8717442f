//! Memory-pack compiler (§4.5).
//!
//! Compiles the four retrieval layers (identity, session, knowledge,
//! long-term) into a single prompt-ready artefact under a token budget.
//! The compiler reads through a [`TenantSession`] but never mutates
//! anything beyond the optional persisted [`MemoryPack`] row itself.

pub mod identity;
pub mod retention;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::collaborators::{parse_json_response, LlmClient};
use crate::entities::{KnowledgeItem, KnowledgeType, Memory};
use crate::error::Result;
use crate::ids::{AnimaId, MemoryPackId};
use crate::retrieval::{
    self, KnowledgeSearchFilter, SemanticSearchFilter, TemporalContext, TimeWindowFilter,
};
use crate::scoring::{self, ScoreReason, ScoreWeights};
use crate::store::Store;
use crate::tenancy::TenantSession;

const IDENTITY_TOKEN_OVERHEAD: u32 = 150;
const SESSION_BUDGET_SHARE: f64 = 0.25;
const KNOWLEDGE_BUDGET_SHARE: f64 = 0.35;
const LONG_TERM_BUDGET_SHARE: f64 = 0.40;
const CHARS_PER_TOKEN: f64 = 4.0;
const SESSION_RECENCY_HALF_LIFE_DAYS: f64 = 1.0;
const SESSION_WINDOW_FETCH_CAP: usize = 200;

/// Tunable retrieval knobs for one pack compile, per §4.5. [`Self::conversational`]
/// is the fixed default preset; [`Self::self_determined`] asks the anima's
/// own LLM collaborator to set the non-grounding fields (limits, weights,
/// thresholds) while identity inclusion, temporal awareness, the session
/// window, and the session-memory cap stay pinned to the conversational
/// values.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub preset: &'static str,
    pub query: Option<String>,
    pub include_identity: bool,
    pub temporal_awareness: bool,
    pub session_window_hours: f64,
    pub max_session_memories: usize,
    pub knowledge_similarity_threshold: f32,
    pub knowledge_types: Option<Vec<KnowledgeType>>,
    pub max_knowledge_items: usize,
    pub long_term_similarity_threshold: f32,
    pub max_long_term_memories: usize,
    pub min_importance: Option<f64>,
    pub recency_half_life_days: f64,
    pub decay_half_life_days: f64,
    pub decay_boost: f64,
    pub weights: ScoreWeights,
    pub max_tokens: u32,
}

impl RetrievalConfig {
    /// Fixed weights and limits tuned for a live back-and-forth: recency
    /// dominates, a 4-hour session window, and modest layer caps.
    pub fn conversational() -> Self {
        Self {
            preset: "conversational",
            query: None,
            include_identity: true,
            temporal_awareness: true,
            session_window_hours: 4.0,
            max_session_memories: 5,
            knowledge_similarity_threshold: 0.7,
            knowledge_types: None,
            max_knowledge_items: 3,
            long_term_similarity_threshold: 0.7,
            max_long_term_memories: 3,
            min_importance: None,
            recency_half_life_days: 7.0,
            decay_half_life_days: 30.0,
            decay_boost: 1.5,
            weights: ScoreWeights::new(0.35, 0.05, 0.20, 0.10, 0.30),
            max_tokens: 2000,
        }
    }

    /// Asks `llm` to set the non-grounding fields of a conversational
    /// baseline for `query`. Identity inclusion, temporal awareness, the
    /// session window, and the session-memory cap are held fixed; anything
    /// the model omits or returns out of range falls back to the
    /// conversational default.
    pub async fn self_determined(llm: &dyn LlmClient, query: &str) -> Result<Self> {
        let mut config = Self::conversational();
        config.preset = "self_determined";
        config.query = Some(query.to_string());
        // Identity inclusion, temporal awareness, and the session-memory cap
        // stay pinned to the conversational preset; the window widens to 24h.
        config.session_window_hours = 24.0;

        let prompt = format!(
            "Given the following user query, choose retrieval parameters for a \
             memory-pack compile. Respond with a single JSON object with keys: \
             knowledge_types (array of FACT|CONCEPT|METHOD|PRINCIPLE|EXPERIENCE, or null for all), \
             max_knowledge_items (integer 1-10), max_long_term_memories (integer 1-10), \
             knowledge_similarity_threshold (float 0-1), long_term_similarity_threshold (float 0-1), \
             min_importance (float 0-1 or null), \
             weight_recency, weight_decay, weight_importance, weight_confidence, weight_similarity \
             (non-negative floats).\n\nQuery: {query}"
        );

        let raw = llm.call(&prompt, 0.2, 400).await.map_err(crate::error::CoreError::from)?;

        let fields: SelfDeterminedFields = match parse_json_response(&raw) {
            Ok(fields) => fields,
            Err(err) => {
                tracing::warn!(error = %err, "self_determined retrieval config fell back to conversational defaults");
                return Ok(config);
            }
        };

        if let Some(types) = fields.knowledge_types {
            let parsed: Vec<KnowledgeType> = types.iter().filter_map(|t| t.parse().ok()).collect();
            if !parsed.is_empty() {
                config.knowledge_types = Some(parsed);
            }
        }
        if let Some(v) = fields.max_knowledge_items {
            config.max_knowledge_items = v.clamp(1, 10) as usize;
        }
        if let Some(v) = fields.max_long_term_memories {
            config.max_long_term_memories = v.clamp(1, 10) as usize;
        }
        if let Some(v) = fields.knowledge_similarity_threshold {
            config.knowledge_similarity_threshold = v.clamp(0.0, 1.0) as f32;
        }
        if let Some(v) = fields.long_term_similarity_threshold {
            config.long_term_similarity_threshold = v.clamp(0.0, 1.0) as f32;
        }
        if fields.min_importance.is_some() {
            config.min_importance = fields.min_importance.map(|v| v.clamp(0.0, 1.0));
        }

        let weights = (
            fields.weight_recency,
            fields.weight_decay,
            fields.weight_importance,
            fields.weight_confidence,
            fields.weight_similarity,
        );
        if let (Some(r), Some(d), Some(i), Some(c), Some(s)) = weights {
            if r >= 0.0 && d >= 0.0 && i >= 0.0 && c >= 0.0 && s >= 0.0 {
                config.weights = ScoreWeights::new(r, d, i, c, s);
            }
        }

        Ok(config)
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct SelfDeterminedFields {
    knowledge_types: Option<Vec<String>>,
    max_knowledge_items: Option<i64>,
    max_long_term_memories: Option<i64>,
    knowledge_similarity_threshold: Option<f64>,
    long_term_similarity_threshold: Option<f64>,
    min_importance: Option<f64>,
    weight_recency: Option<f64>,
    weight_decay: Option<f64>,
    weight_importance: Option<f64>,
    weight_confidence: Option<f64>,
    weight_similarity: Option<f64>,
}

/// One memory or knowledge item plus the score (and the reason it was
/// scored that way) that earned it a slot in the pack.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f64,
    pub reason: ScoreReason,
}

#[derive(Debug, Clone)]
pub struct ScoredKnowledge {
    pub item: KnowledgeItem,
    pub score: f64,
}

/// The compiled, prompt-ready result of one pack compile.
#[derive(Debug, Clone)]
pub struct CompiledPack {
    pub anima_id: AnimaId,
    pub query: Option<String>,
    pub preset: &'static str,
    pub identity_prose: Option<String>,
    pub temporal_context: Option<TemporalContext>,
    pub session_memories: Vec<ScoredMemory>,
    pub knowledge_items: Vec<ScoredKnowledge>,
    pub long_term_memories: Vec<ScoredMemory>,
    pub token_count: u32,
    pub max_tokens: u32,
    pub prompt: String,
    pub compiled_at: DateTime<Utc>,
}

fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as u32
}

/// Greedily keeps items, in the given (already score-sorted) order, while
/// their cumulative estimated token cost stays within `budget`. Stops at
/// the first item that would exceed the budget rather than skipping ahead
/// to a smaller one later in the list.
fn trim_to_budget<T>(items: Vec<(T, String)>, budget_tokens: u32) -> (Vec<T>, u32) {
    let mut kept = Vec::new();
    let mut spent = 0u32;
    for (item, text) in items {
        let cost = estimate_tokens(&text);
        if spent + cost > budget_tokens && !kept.is_empty() {
            break;
        }
        spent += cost;
        kept.push(item);
    }
    (kept, spent)
}

/// Compiles a memory pack for `anima_id` per `config`. Reads are scoped
/// through `session`; `store` carries out the underlying queries.
/// `embedding` is consulted only when `config.query` is set.
pub async fn compile(
    session: &TenantSession<'_>,
    store: &Store,
    embedding: &dyn crate::collaborators::EmbeddingClient,
    anima_id: AnimaId,
    config: &RetrievalConfig,
) -> Result<CompiledPack> {
    session.check_anima_owned(anima_id)?;
    let now = Utc::now();

    let query_embedding = match &config.query {
        Some(q) if !q.trim().is_empty() => Some(embedding.embed_text(q).await.map_err(crate::error::CoreError::from)?),
        _ => None,
    };

    let identity_prose = if config.include_identity {
        store.get_identity(anima_id)?.map(|identity| identity::render(&identity))
    } else {
        None
    };

    let session_window_start = now - chrono::Duration::milliseconds((config.session_window_hours * 3_600_000.0) as i64);

    let session_filter = TimeWindowFilter {
        states: vec![crate::entities::MemoryState::Active],
        min_time: Some(session_window_start),
        max_time: None,
        min_importance: None,
        min_confidence: None,
        limit: SESSION_WINDOW_FETCH_CAP,
    };
    let session_candidates = retrieval::time_window_memories(session, store, anima_id, &session_filter)?;
    let mut session_scored: Vec<ScoredMemory> = session_candidates
        .into_iter()
        .map(|memory| {
            let score = scoring::recency(memory.created_at, now, SESSION_RECENCY_HALF_LIFE_DAYS);
            ScoredMemory {
                memory,
                score,
                reason: ScoreReason::SessionRecency,
            }
        })
        .collect();
    session_scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
    session_scored.truncate(config.max_session_memories);

    let temporal_context = if config.temporal_awareness && session_scored.is_empty() {
        retrieval::temporal_context(session, store, anima_id)?
    } else {
        None
    };

    let mut knowledge_scored: Vec<ScoredKnowledge> = Vec::new();
    if let Some(embedding) = &query_embedding {
        let filter = KnowledgeSearchFilter {
            types: config.knowledge_types.clone(),
            threshold: config.knowledge_similarity_threshold,
            over_fetch: 3,
            k: config.max_knowledge_items,
        };
        let candidates = retrieval::semantic_search_knowledge(session, store, anima_id, embedding, &filter)?;
        knowledge_scored = candidates
            .into_iter()
            .map(|(item, similarity)| {
                let score = scoring::knowledge_score(Some(item.confidence), similarity as f64);
                ScoredKnowledge { item, score }
            })
            .collect();
        knowledge_scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        knowledge_scored.truncate(config.max_knowledge_items);
    }

    let mut long_term_scored: Vec<ScoredMemory> = Vec::new();
    if let Some(embedding) = &query_embedding {
        let filter = SemanticSearchFilter {
            states: vec![crate::entities::MemoryState::Active, crate::entities::MemoryState::Decaying],
            max_time: Some(session_window_start),
            threshold: config.long_term_similarity_threshold,
            over_fetch: 3,
            k: config.max_long_term_memories,
        };
        let candidates = retrieval::semantic_search_memories(session, store, anima_id, embedding, &filter)?;
        long_term_scored = candidates
            .into_iter()
            .filter(|(memory, _)| match config.min_importance {
                Some(min) => memory.importance.unwrap_or(0.5) >= min,
                None => true,
            })
            .map(|(memory, similarity)| {
                let recency = scoring::recency(memory.updated_at, now, config.recency_half_life_days);
                let decay = scoring::decay(memory.updated_at, Some(memory.updated_at), 0, config.decay_half_life_days, config.decay_boost);
                let score = scoring::combined(memory.importance, memory.confidence, recency, decay, Some(similarity as f64), config.weights);
                ScoredMemory {
                    memory,
                    score,
                    reason: ScoreReason::Hybrid,
                }
            })
            .collect();
        long_term_scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        long_term_scored.truncate(config.max_long_term_memories);
    }

    let identity_tokens = if identity_prose.is_some() { IDENTITY_TOKEN_OVERHEAD } else { 0 };
    let remainder = config.max_tokens.saturating_sub(identity_tokens);
    let session_budget = (remainder as f64 * SESSION_BUDGET_SHARE) as u32;
    let knowledge_budget = (remainder as f64 * KNOWLEDGE_BUDGET_SHARE) as u32;
    let long_term_budget = (remainder as f64 * LONG_TERM_BUDGET_SHARE) as u32;

    let session_texts: Vec<(ScoredMemory, String)> =
        session_scored.into_iter().map(|sm| (sm.clone(), sm.memory.summary.clone())).collect();
    let (session_kept, session_spent) = trim_to_budget(session_texts, session_budget);

    let knowledge_texts: Vec<(ScoredKnowledge, String)> =
        knowledge_scored.into_iter().map(|sk| (sk.clone(), sk.item.content.clone())).collect();
    let (knowledge_kept, knowledge_spent) = trim_to_budget(knowledge_texts, knowledge_budget);

    let long_term_texts: Vec<(ScoredMemory, String)> =
        long_term_scored.into_iter().map(|sm| (sm.clone(), sm.memory.summary.clone())).collect();
    let (long_term_kept, long_term_spent) = trim_to_budget(long_term_texts, long_term_budget);

    let mut prompt_sections = Vec::new();
    if let Some(prose) = &identity_prose {
        prompt_sections.push(prose.clone());
    }
    if let Some(context) = &temporal_context {
        prompt_sections.push(context.formatted.clone());
    }
    if !session_kept.is_empty() {
        let lines: Vec<String> = session_kept.iter().map(|sm| format!("- {}", sm.memory.summary)).collect();
        prompt_sections.push(format!("Recent conversation context:\n{}", lines.join("\n")));
    }
    if !knowledge_kept.is_empty() {
        let lines: Vec<String> = knowledge_kept
            .iter()
            .map(|sk| format!("- [{}] {}", sk.item.knowledge_type.as_str(), sk.item.content))
            .collect();
        prompt_sections.push(format!("Relevant knowledge:\n{}", lines.join("\n")));
    }
    if !long_term_kept.is_empty() {
        let lines: Vec<String> = long_term_kept
            .iter()
            .map(|sm| format!("- [{}] {}", sm.memory.time_start.format("%Y-%m-%d"), sm.memory.summary))
            .collect();
        prompt_sections.push(format!("Related long-term memories:\n{}", lines.join("\n")));
    }
    let prompt = prompt_sections.join("\n\n");

    let token_count = identity_tokens + session_spent + knowledge_spent + long_term_spent;

    Ok(CompiledPack {
        anima_id,
        query: config.query.clone(),
        preset: config.preset,
        identity_prose,
        temporal_context,
        session_memories: session_kept,
        knowledge_items: knowledge_kept,
        long_term_memories: long_term_kept,
        token_count,
        max_tokens: config.max_tokens,
        prompt,
        compiled_at: now,
    })
}

/// Convenience entry point for callers outside this crate, which cannot
/// construct a [`TenantSession`] directly (its constructor is
/// crate-private, like every other workflow entry point's — see
/// [`crate::synthesis::run_synthesis`], [`crate::dream::start_session`]).
/// Equivalent to opening a session for `user_id` and calling [`compile`].
pub async fn compile_for_user(
    store: &Store,
    embedding: &dyn crate::collaborators::EmbeddingClient,
    user_id: crate::ids::UserId,
    anima_id: AnimaId,
    config: &RetrievalConfig,
) -> Result<CompiledPack> {
    let session = TenantSession::new(user_id, store);
    compile(&session, store, embedding, anima_id, config).await
}

/// Persists `pack` and enforces retention as a fire-and-forget background
/// task, matching the auto-knowledge hook's pattern (§4.10): callers never
/// await the write, and any failure is logged, not propagated.
pub fn schedule_persist(store: Arc<Store>, pack: &CompiledPack, max_packs: u32) {
    let row = crate::entities::MemoryPack {
        id: MemoryPackId::new(),
        anima_id: pack.anima_id,
        query: pack.query.clone(),
        preset: Some(pack.preset.to_string()),
        session_count: pack.session_memories.len() as u32,
        knowledge_count: pack.knowledge_items.len() as u32,
        long_term_count: pack.long_term_memories.len() as u32,
        token_count: pack.token_count,
        max_tokens: pack.max_tokens,
        content: serde_json::json!({ "prompt": pack.prompt }),
        compiled_at: pack.compiled_at,
    };
    let anima_id = pack.anima_id;

    tokio::spawn(async move {
        if let Err(err) = store.create_memory_pack(&row) {
            tracing::warn!(anima = %anima_id, error = %err, "failed to persist compiled memory pack");
            return;
        }
        if let Err(err) = retention::enforce_retention(&store, anima_id, max_packs) {
            tracing::warn!(anima = %anima_id, error = %err, "failed to enforce memory pack retention");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::DeterministicEmbeddingClient;
    use crate::entities::{Anima, Memory};
    use crate::ids::{OrganizationId, UserId};

    #[tokio::test]
    async fn compile_without_query_skips_embedding_layers() {
        let store = Store::open_in_memory().unwrap();
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let mut memory = Memory::new(anima.id, "we discussed rust lifetimes", "discussed lifetimes");
        memory.importance = Some(0.8);
        store.create_memory(&memory).unwrap();

        let embedding = DeterministicEmbeddingClient::default();
        let config = RetrievalConfig::conversational();

        let session = TenantSession::new(anima.user_id, &store);
        let pack = compile(&session, &store, &embedding, anima.id, &config).await.unwrap();

        assert_eq!(pack.session_memories.len(), 1);
        assert!(pack.knowledge_items.is_empty());
        assert!(pack.long_term_memories.is_empty());
        assert!(pack.prompt.contains("discussed lifetimes"));
    }

    #[tokio::test]
    async fn compile_rejects_foreign_anima() {
        let store = Store::open_in_memory().unwrap();
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let embedding = DeterministicEmbeddingClient::default();
        let config = RetrievalConfig::conversational();
        let other_user = UserId::new();

        let session = TenantSession::new(other_user, &store);
        let result = compile(&session, &store, &embedding, anima.id, &config).await;
        assert!(result.is_err());
    }

    #[test]
    fn trim_to_budget_always_keeps_first_item() {
        let items = vec![("a", "x".repeat(1000))];
        let (kept, spent) = trim_to_budget(items, 1);
        assert_eq!(kept, vec!["a"]);
        assert!(spent > 1);
    }

    #[test]
    fn trim_to_budget_stops_before_exceeding() {
        let items = vec![("a", "xxxx".to_string()), ("b", "xxxx".to_string()), ("c", "xxxx".to_string())];
        let (kept, spent) = trim_to_budget(items, 2);
        assert_eq!(kept, vec!["a"]);
        assert_eq!(spent, 1);
    }
}
