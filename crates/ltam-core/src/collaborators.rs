//! External collaborator contracts (§6).
//!
//! The embedding model, the LLM, and (at a higher layer) the scheduler
//! runtime are collaborators this crate calls into, never implements
//! itself. Real backends are supplied by the binary composing this crate
//! (`ltam-scheduler`'s/`ltam-cli`'s `main.rs`); [`testing`] provides
//! deterministic stand-ins used by this crate's own tests.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("embedding request failed: {0}")]
    Embedding(String),

    #[error("llm request failed: {0}")]
    Llm(String),

    #[error("invalid json response: {0}")]
    InvalidJson(String),
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, CollaboratorError>;

    /// Preserves index alignment with `texts`: the returned vector has the
    /// same length and order as the input, even for empty input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError>;
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String, CollaboratorError>;

    /// A blocking variant for call sites that cannot hold an `.await`
    /// across a tenant session (e.g. inside a synchronous store closure).
    fn call_sync(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String, CollaboratorError>;
}

/// The collaborator handles a workflow run needs, constructed once at the
/// composition root (`ltam-scheduler`'s/`ltam-cli`'s `main.rs`) and passed
/// down as `Arc<Collaborators>` rather than reached for as a global
/// singleton.
pub struct Collaborators {
    pub embedding: std::sync::Arc<dyn EmbeddingClient>,
    pub llm: std::sync::Arc<dyn LlmClient>,
    /// Global off-switch for fire-and-forget background work (the
    /// auto-knowledge hook, §4.10). Checked once at the call site.
    pub background_jobs_enabled: bool,
}

/// Decodes `raw` as `T`, extracting the first `{...}` or `[...]` span if
/// the LLM wrapped its JSON in prose or a markdown fence. A single error
/// kind covers every failure mode (missing, malformed, schema mismatch)
/// per the redesign note in §9 — callers don't need to distinguish why
/// parsing failed, only that the response can't be used.
pub fn parse_json_response<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, CollaboratorError> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }

    let candidate = extract_json_span(trimmed).ok_or_else(|| {
        CollaboratorError::InvalidJson(format!("no JSON object or array found in response: {trimmed}"))
    })?;

    serde_json::from_str(candidate)
        .map_err(|e| CollaboratorError::InvalidJson(format!("{e}: {candidate}")))
}

fn extract_json_span(s: &str) -> Option<&str> {
    let open_candidates = ['{', '['];
    let start = s.find(|c| open_candidates.contains(&c))?;
    let open = s.as_bytes()[start] as char;
    let close = if open == '{' { '}' } else { ']' };
    let end = s.rfind(close)?;
    if end < start {
        return None;
    }
    Some(&s[start..=end])
}

/// Deterministic stand-ins for use in this crate's own tests. Never
/// compiled into a production binary — `ltam-scheduler`/`ltam-cli` supply
/// real clients at their composition root.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Produces a fixed-dimension embedding deterministically derived from
    /// the input text's bytes, so semantically-identical test fixtures
    /// compare as similar without needing a real model.
    pub struct DeterministicEmbeddingClient {
        pub dimensions: usize,
    }

    impl Default for DeterministicEmbeddingClient {
        fn default() -> Self {
            Self {
                dimensions: crate::entities::Embedding::DIMENSIONS,
            }
        }
    }

    #[async_trait]
    impl EmbeddingClient for DeterministicEmbeddingClient {
        async fn embed_text(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
            Ok(deterministic_vector(text, self.dimensions))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
            Ok(texts.iter().map(|t| deterministic_vector(t, self.dimensions)).collect())
        }
    }

    fn deterministic_vector(text: &str, dimensions: usize) -> Vec<f32> {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(text.as_bytes());
        (0..dimensions)
            .map(|i| {
                let byte = digest[i % digest.len()];
                (byte as f32 / 255.0) * 2.0 - 1.0
            })
            .collect()
    }

    /// Replays a fixed queue of canned responses, one per call, so tests
    /// can assert exact pipeline behavior without a real model in the
    /// loop. Panics if the queue is exhausted.
    pub struct ScriptedLlmClient {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedLlmClient {
        pub fn new(responses: Vec<String>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }

        fn next(&self) -> String {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .expect("scripted llm client queue exhausted")
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlmClient {
        async fn call(&self, _prompt: &str, _temperature: f32, _max_tokens: u32) -> Result<String, CollaboratorError> {
            Ok(self.next())
        }

        fn call_sync(&self, _prompt: &str, _temperature: f32, _max_tokens: u32) -> Result<String, CollaboratorError> {
            Ok(self.next())
        }
    }

    impl ScriptedLlmClient {
        /// Builds a client that replays `responses` in the given order
        /// (the underlying queue pops from the back, so this reverses it
        /// once at construction).
        pub fn in_order(mut responses: Vec<String>) -> Self {
            responses.reverse();
            Self::new(responses)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Deserialize, PartialEq, Debug)]
    struct Decision {
        should_merge: bool,
    }

    #[test]
    fn parse_json_response_handles_plain_json() {
        let decision: Decision = parse_json_response(r#"{"should_merge": true}"#).unwrap();
        assert!(decision.should_merge);
    }

    #[test]
    fn parse_json_response_extracts_from_prose_wrapper() {
        let raw = "Sure, here's my answer:\n```json\n{\"should_merge\": false}\n```\nHope that helps!";
        let decision: Decision = parse_json_response(raw).unwrap();
        assert!(!decision.should_merge);
    }

    #[test]
    fn parse_json_response_rejects_garbage() {
        let result: Result<Decision, _> = parse_json_response("not json at all");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn deterministic_embedding_is_stable() {
        let client = testing::DeterministicEmbeddingClient::default();
        let a = client.embed_text("hello world").await.unwrap();
        let b = client.embed_text("hello world").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn embed_batch_preserves_alignment() {
        let client = testing::DeterministicEmbeddingClient::default();
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vectors = client.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), texts.len());
        assert_eq!(vectors[0], client.embed_text("a").await.unwrap());
    }

    #[tokio::test]
    async fn embed_batch_empty_input_yields_empty_output() {
        let client = testing::DeterministicEmbeddingClient::default();
        let vectors = client.embed_batch(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
