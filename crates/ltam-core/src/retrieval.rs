//! Stateless retrieval helpers over the store (§4.4).
//!
//! Every function here takes a `&TenantSession` plus whatever filter it
//! needs and returns plain data — no caching, no cross-call state. The
//! pack compiler in [`crate::pack`] is the primary caller.

use chrono::{DateTime, Duration, Utc};

use crate::entities::{Memory, MemoryState};
use crate::error::Result;
use crate::ids::AnimaId;
use crate::tenancy::TenantSession;

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

/// `[min_time, max_time)` filter for a time-window query.
#[derive(Debug, Clone, Default)]
pub struct TimeWindowFilter {
    pub states: Vec<MemoryState>,
    pub min_time: Option<DateTime<Utc>>,
    pub max_time: Option<DateTime<Utc>>,
    pub min_importance: Option<f64>,
    pub min_confidence: Option<f64>,
    pub limit: usize,
}

/// Anima, state set, optional `[min_time, max_time)`, importance/confidence
/// floors, ordered `created_at` descending.
pub fn time_window_memories(
    session: &TenantSession,
    store: &crate::store::Store,
    anima_id: AnimaId,
    filter: &TimeWindowFilter,
) -> Result<Vec<Memory>> {
    session.check_anima_owned(anima_id)?;
    let memories = store.list_memories_window(
        anima_id,
        &filter.states,
        filter.min_time,
        filter.max_time,
        filter.min_importance,
        filter.min_confidence,
        filter.limit,
    )?;
    Ok(memories)
}

#[derive(Debug, Clone, Default)]
pub struct SemanticSearchFilter {
    pub states: Vec<MemoryState>,
    pub max_time: Option<DateTime<Utc>>,
    pub threshold: f32,
    pub over_fetch: usize,
    pub k: usize,
}

/// Coarse SQL pre-filter by state/time, then client-side cosine re-rank
/// (permitted substitution, §9 — rusqlite has no vector column type).
/// Admits `distance < 1 - threshold`, ordered by ascending distance,
/// `k` capped at 100.
pub fn semantic_search_memories(
    session: &TenantSession,
    store: &crate::store::Store,
    anima_id: AnimaId,
    query_embedding: &[f32],
    filter: &SemanticSearchFilter,
) -> Result<Vec<(Memory, f32)>> {
    session.check_anima_owned(anima_id)?;
    let k = filter.k.min(100);
    let prefetch = (k * filter.over_fetch.max(1)).max(k);
    let candidates =
        store.list_memories_with_embedding(anima_id, &filter.states, filter.max_time, prefetch)?;

    let mut scored: Vec<(Memory, f32)> = candidates
        .into_iter()
        .filter_map(|memory| {
            let embedding = memory.embedding.as_ref()?;
            let similarity = cosine_similarity(query_embedding, &embedding.vector);
            let distance = 1.0 - similarity;
            if distance < 1.0 - filter.threshold {
                Some((memory, similarity))
            } else {
                None
            }
        })
        .collect();

    scored.sort_by(|a, b| (1.0 - a.1).partial_cmp(&(1.0 - b.1)).unwrap());
    scored.truncate(k);
    Ok(scored)
}

use crate::entities::{KnowledgeItem, KnowledgeType};

#[derive(Debug, Clone, Default)]
pub struct KnowledgeSearchFilter {
    pub types: Option<Vec<KnowledgeType>>,
    pub threshold: f32,
    pub over_fetch: usize,
    pub k: usize,
}

/// Same shape as [`semantic_search_memories`], restricted to an optional
/// type set (OR semantics).
pub fn semantic_search_knowledge(
    session: &TenantSession,
    store: &crate::store::Store,
    anima_id: AnimaId,
    query_embedding: &[f32],
    filter: &KnowledgeSearchFilter,
) -> Result<Vec<(KnowledgeItem, f32)>> {
    session.check_anima_owned(anima_id)?;
    let k = filter.k.min(100);
    let prefetch = (k * filter.over_fetch.max(1)).max(k);
    let candidates =
        store.list_knowledge_with_embedding(anima_id, filter.types.as_deref(), prefetch)?;

    let mut scored: Vec<(KnowledgeItem, f32)> = candidates
        .into_iter()
        .filter_map(|item| {
            let embedding = item.embedding.as_ref()?;
            let similarity = cosine_similarity(query_embedding, &embedding.vector);
            let distance = 1.0 - similarity;
            if distance < 1.0 - filter.threshold {
                Some((item, similarity))
            } else {
                None
            }
        })
        .collect();

    scored.sort_by(|a, b| (1.0 - a.1).partial_cmp(&(1.0 - b.1)).unwrap());
    scored.truncate(k);
    Ok(scored)
}

/// Most recent non-deleted `message.in`/`message.out` event, outer-joined
/// to its linked memory's summary, plus a natural-language delta sentence.
#[derive(Debug, Clone)]
pub struct TemporalContext {
    pub last_event_at: DateTime<Utc>,
    pub hours_ago: f64,
    pub memory_summary: Option<String>,
    pub formatted: String,
}

pub fn temporal_context(
    session: &TenantSession,
    store: &crate::store::Store,
    anima_id: AnimaId,
) -> Result<Option<TemporalContext>> {
    session.check_anima_owned(anima_id)?;
    let Some((event, memory_summary)) = store.latest_message_with_memory_summary(anima_id)? else {
        return Ok(None);
    };

    let now = Utc::now();
    let delta = now - event.occurred_at;
    let hours_ago = delta.num_milliseconds() as f64 / 1000.0 / 3600.0;
    let formatted = format_temporal_delta(delta, memory_summary.as_deref());

    Ok(Some(TemporalContext {
        last_event_at: event.occurred_at,
        hours_ago,
        memory_summary,
        formatted,
    }))
}

fn format_temporal_delta(delta: Duration, memory_summary: Option<&str>) -> String {
    let base = if delta < Duration::hours(1) {
        "less than an hour ago".to_string()
    } else if delta < Duration::hours(24) {
        format!("{} hours ago", delta.num_hours())
    } else if delta < Duration::hours(48) {
        "yesterday".to_string()
    } else {
        format!("{} days ago", delta.num_days())
    };

    match memory_summary {
        Some(summary) if !summary.is_empty() => format!("Your last communication with the user was {base} about {summary}."),
        _ => format!("Your last communication with the user was {base}."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![0.5, 0.25, 0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn format_temporal_delta_buckets_correctly() {
        assert_eq!(format_temporal_delta(Duration::minutes(10), None), "Your last communication with the user was less than an hour ago.");
        assert_eq!(format_temporal_delta(Duration::hours(5), None), "Your last communication with the user was 5 hours ago.");
        assert_eq!(format_temporal_delta(Duration::hours(30), None), "Your last communication with the user was yesterday.");
        assert_eq!(format_temporal_delta(Duration::days(4), None), "Your last communication with the user was 4 days ago.");
    }

    #[test]
    fn format_temporal_delta_suffixes_memory_summary() {
        let formatted = format_temporal_delta(Duration::minutes(5), Some("discussed the roadmap"));
        assert_eq!(formatted, "Your last communication with the user was less than an hour ago about discussed the roadmap.");
    }
}
