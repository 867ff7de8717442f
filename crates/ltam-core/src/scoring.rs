//! Pure, deterministic scoring primitives (§4.1).
//!
//! Every function here is a total function of its inputs: no I/O, no
//! clock reads beyond an explicitly passed reference time. Results are
//! always clamped to `[0, 1]`.

use chrono::{DateTime, Utc};

const LN2: f64 = std::f64::consts::LN_2;
const SECONDS_PER_DAY: f64 = 86_400.0;

fn age_days(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_DAY
}

/// Exponential recency decay: `exp(-ln2 * age_days / half_life_days)`,
/// clamped to `[0, 1]`. A memory from the future (negative age) scores 1.
pub fn recency(memory_time: DateTime<Utc>, ref_time: DateTime<Utc>, half_life_days: f64) -> f64 {
    let age = age_days(memory_time, ref_time).max(0.0);
    if half_life_days <= 0.0 {
        return if age <= 0.0 { 1.0 } else { 0.0 };
    }
    let value = (-LN2 * age / half_life_days).exp();
    value.clamp(0.0, 1.0)
}

/// Spaced-repetition-inspired decay, boosted by access count and capped at
/// a 365-day effective half-life.
///
/// `effective_half_life = min(365, base_half_life_days * boost^access_count)`
/// `decay = 1 - exp(-ln2 * age_days / effective_half_life)`
///
/// `age_days` is measured from `last_accessed` when present, else from
/// `memory_time`. Future or zero ages yield 0.
pub fn decay(
    memory_time: DateTime<Utc>,
    last_accessed: Option<DateTime<Utc>>,
    access_count: u32,
    base_half_life_days: f64,
    boost: f64,
) -> f64 {
    let anchor = last_accessed.unwrap_or(memory_time);
    let age = age_days(anchor, Utc::now());
    if age <= 0.0 {
        return 0.0;
    }
    let effective_half_life = (base_half_life_days * boost.powi(access_count as i32)).min(365.0);
    if effective_half_life <= 0.0 {
        return 1.0;
    }
    let value = 1.0 - (-LN2 * age / effective_half_life).exp();
    value.clamp(0.0, 1.0)
}

/// Weights for the [`combined`] score, normalized at construction.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub recency: f64,
    pub decay: f64,
    pub importance: f64,
    pub confidence: f64,
    pub similarity: f64,
}

impl ScoreWeights {
    pub fn new(recency: f64, decay: f64, importance: f64, confidence: f64, similarity: f64) -> Self {
        Self {
            recency,
            decay,
            importance,
            confidence,
            similarity,
        }
    }

    /// Normalizes the five weights to sum to 1, dropping `similarity` (and
    /// renormalizing the rest) when `has_similarity` is false.
    fn normalized(&self, has_similarity: bool) -> (f64, f64, f64, f64, f64) {
        if has_similarity {
            let total = self.recency + self.decay + self.importance + self.confidence + self.similarity;
            if total <= 0.0 {
                return (0.2, 0.2, 0.2, 0.2, 0.2);
            }
            (
                self.recency / total,
                self.decay / total,
                self.importance / total,
                self.confidence / total,
                self.similarity / total,
            )
        } else {
            let total = self.recency + self.decay + self.importance + self.confidence;
            if total <= 0.0 {
                return (0.25, 0.25, 0.25, 0.25, 0.0);
            }
            (
                self.recency / total,
                self.decay / total,
                self.importance / total,
                self.confidence / total,
                0.0,
            )
        }
    }
}

/// Multi-factor combined score. `decay` here substitutes `(1 - decay)` into
/// the weighted sum (a high decay score should *lower* the combined score).
/// Missing `importance`/`confidence` default to 0.5; missing `similarity`
/// drops its weight and renormalizes the rest.
pub fn combined(
    importance: Option<f64>,
    confidence: Option<f64>,
    recency: f64,
    decay: f64,
    similarity: Option<f64>,
    weights: ScoreWeights,
) -> f64 {
    let importance = importance.unwrap_or(0.5);
    let confidence = confidence.unwrap_or(0.5);
    let (w_recency, w_decay, w_importance, w_confidence, w_similarity) =
        weights.normalized(similarity.is_some());

    let mut score = w_recency * recency
        + w_decay * (1.0 - decay)
        + w_importance * importance
        + w_confidence * confidence;

    if let Some(similarity) = similarity {
        score += w_similarity * similarity;
    }

    score.clamp(0.0, 1.0)
}

/// `0.5 * confidence + 0.5 * similarity`, confidence defaulting to 0.5.
pub fn knowledge_score(confidence: Option<f64>, similarity: f64) -> f64 {
    let confidence = confidence.unwrap_or(0.5);
    (0.5 * confidence + 0.5 * similarity).clamp(0.0, 1.0)
}

/// Reason a memory/knowledge item was included in a compiled pack layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreReason {
    SessionRecency,
    Hybrid,
    KnowledgeSimilarity,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn recency_identity() {
        let t = Utc::now();
        assert!((recency(t, t, 7.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn recency_half_life_point() {
        let t = Utc::now();
        let half_life = 7.0;
        let aged = t - Duration::days(7);
        assert!((recency(aged, t, half_life) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn recency_future_is_one() {
        let t = Utc::now();
        let future = t + Duration::days(10);
        assert_eq!(recency(future, t, 7.0), 1.0);
    }

    #[test]
    fn recency_is_clamped() {
        let t = Utc::now();
        let ancient = t - Duration::days(100_000);
        let v = recency(ancient, t, 1.0);
        assert!((0.0..=1.0).contains(&v));
    }

    #[test]
    fn decay_monotonic_in_age() {
        let now = Utc::now();
        let recent = now - Duration::days(1);
        let old = now - Duration::days(60);
        let d_recent = decay(recent, None, 0, 30.0, 1.5);
        let d_old = decay(old, None, 0, 30.0, 1.5);
        assert!(d_old >= d_recent);
    }

    #[test]
    fn decay_non_increasing_in_access_count() {
        let now = Utc::now();
        let t = now - Duration::days(45);
        let d0 = decay(t, None, 0, 30.0, 1.5);
        let d3 = decay(t, None, 3, 30.0, 1.5);
        assert!(d3 <= d0);
    }

    #[test]
    fn decay_is_clamped() {
        let now = Utc::now();
        let ancient = now - Duration::days(100_000);
        let v = decay(ancient, None, 0, 30.0, 1.5);
        assert!((0.0..=1.0).contains(&v));
    }

    #[test]
    fn combined_score_clamped() {
        let weights = ScoreWeights::new(0.35, 0.05, 0.2, 0.1, 0.3);
        let v = combined(Some(1.0), Some(1.0), 1.0, 0.0, Some(1.0), weights);
        assert!((0.0..=1.0).contains(&v));
        assert!(v > 0.9);
    }

    #[test]
    fn combined_without_similarity_renormalizes() {
        let weights = ScoreWeights::new(0.35, 0.05, 0.2, 0.1, 0.3);
        let v = combined(Some(0.5), Some(0.5), 0.5, 0.5, None, weights);
        assert!((0.0..=1.0).contains(&v));
    }

    #[test]
    fn knowledge_score_defaults_confidence() {
        let v = knowledge_score(None, 1.0);
        assert!((v - 0.75).abs() < 1e-9);
    }
}
