//! Auto-knowledge hook (§4.10).
//!
//! A single fire-and-forget entry point: after a memory is synthesized,
//! the caller (today, only [`crate::synthesis::run_synthesis`]) schedules
//! this hook instead of awaiting knowledge extraction inline. Errors are
//! logged and swallowed here; they never reach the parent synthesis run.

use std::sync::Arc;

use crate::collaborators::Collaborators;
use crate::ids::{MemoryId, UserId};
use crate::store::Store;
use crate::synthesis::{run_knowledge_synthesis, DedupPolicy};

/// Schedules a detached task that runs the knowledge-synthesis pipeline
/// for `memory_id`. Returns immediately; the caller never observes the
/// outcome. Disabled at the call site when `background_jobs_enabled` is
/// false (checked by the caller, not here, since that flag lives on
/// [`Collaborators`] and the caller already holds one).
pub fn trigger_auto_knowledge_synthesis(store: Arc<Store>, collaborators: Arc<Collaborators>, user_id: UserId, memory_id: MemoryId) {
    tokio::spawn(async move {
        let result = run_knowledge_synthesis(
            &store,
            &collaborators,
            user_id,
            memory_id,
            DedupPolicy::Append,
            true,
        )
        .await;

        match result {
            Ok(ids) => {
                tracing::debug!(memory = %memory_id, created = ids.len(), "auto-knowledge hook completed");
            }
            Err(err) => {
                tracing::warn!(memory = %memory_id, error = %err, "auto-knowledge hook failed; abandoning run");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::{DeterministicEmbeddingClient, ScriptedLlmClient};
    use crate::entities::{Anima, Memory};
    use crate::ids::OrganizationId;

    #[tokio::test]
    async fn hook_creates_knowledge_in_background() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();
        let memory = Memory::new(anima.id, "detailed content worth distilling", "summary");
        store.create_memory(&memory).unwrap();

        let extraction = r#"[{"knowledge_type": "FACT", "content": "a durable fact worth keeping", "summary": "durable fact", "confidence": 0.8}]"#;
        let collaborators = Arc::new(Collaborators {
            embedding: Arc::new(DeterministicEmbeddingClient::default()),
            llm: Arc::new(ScriptedLlmClient::in_order(vec![extraction.to_string()])),
            background_jobs_enabled: true,
        });

        trigger_auto_knowledge_synthesis(Arc::clone(&store), Arc::clone(&collaborators), anima.user_id, memory.id);

        // Fire-and-forget: give the spawned task a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let ids = store.find_knowledge_ids_by_source_memory(memory.id).unwrap();
        assert_eq!(ids.len(), 1);
    }
}
