//! Dream curation journey (spec §8, scenarios S4 and S5): deep-sleep
//! merges near-duplicate memories, and light-sleep ages a low-importance,
//! high-decay memory through `active -> decaying -> archived`.

use std::sync::Arc;

use chrono::Utc;
use ltam_core::collaborators::testing::{DeterministicEmbeddingClient, ScriptedLlmClient};
use ltam_core::dream::{self, DreamConfig};
use ltam_core::entities::{Anima, DreamStatus, DreamTrigger, Memory, MemoryState};
use ltam_core::ids::{OrganizationId, UserId};
use ltam_core::store::Store;
use ltam_core::Collaborators;

fn seed_collaborators(llm_responses: Vec<String>) -> Arc<Collaborators> {
    Arc::new(Collaborators {
        embedding: Arc::new(DeterministicEmbeddingClient::default()),
        llm: Arc::new(ScriptedLlmClient::in_order(llm_responses)),
        background_jobs_enabled: false,
    })
}

#[tokio::test]
async fn near_duplicate_memories_merge_and_sources_soft_delete() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();

    // Same summary text so the Jaccard fallback (no embeddings set) finds
    // them similar without needing a real model.
    let mut m1 = Memory::new(anima.id, "user asked about deploying to production", "deploy question about production rollout");
    let mut m2 = Memory::new(anima.id, "user asked again about deploying to production", "deploy question about production rollout again");
    m1.confidence = Some(0.9);
    m2.confidence = Some(0.9);
    store.create_memory(&m1).unwrap();
    store.create_memory(&m2).unwrap();

    let merge_response = r#"{"should_merge": true, "merged_summary": "discussed production deploy", "importance": 0.6, "confidence": 0.8, "reasoning": "duplicate discussion"}"#;
    let collaborators = seed_collaborators(vec![merge_response.to_string()]);

    let session = dream::start_session(&store, anima.user_id, anima.id, DreamTrigger::Manual, None).unwrap();
    let result = dream::run_dream(&store, &collaborators, anima.user_id, anima.id, session, DreamConfig::default())
        .await
        .unwrap();

    assert_eq!(result.status, DreamStatus::Completed);
    assert_eq!(result.memories_created, 1);
    assert_eq!(result.memories_modified, 2);

    let actions = store.list_dream_actions(result.id).unwrap();
    let merge_action = actions.iter().find(|a| a.action_type == ltam_core::entities::ActionType::Merge).expect("a merge action was recorded");
    assert_eq!(merge_action.source_memory_ids.len(), 2);
    assert_eq!(merge_action.result_memory_ids.as_ref().map(Vec::len), Some(1));

    let m1_after = store.get_memory(m1.id, true).unwrap().unwrap();
    let m2_after = store.get_memory(m2.id, true).unwrap().unwrap();
    assert!(m1_after.is_deleted);
    assert!(m2_after.is_deleted);

    let merged_id = merge_action.result_memory_ids.as_ref().unwrap()[0];
    let merged = store.get_memory(merged_id, false).unwrap().unwrap();
    let merged_from = merged.merged_from();
    assert!(merged_from.contains(&m1.id));
    assert!(merged_from.contains(&m2.id));
}

#[tokio::test]
async fn low_importance_high_decay_memory_ages_through_its_lifecycle() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();

    let now = Utc::now();
    let mut aging = Memory::new(anima.id, "a minor aside from a long time ago", "a minor aside worth noting from before");
    aging.importance = Some(0.1);
    aging.confidence = Some(0.9);
    aging.updated_at = now - chrono::Duration::days(60);
    store.create_memory(&aging).unwrap();

    let mut already_decaying = Memory::new(anima.id, "an older memory already marked decaying", "an older memory already decaying for a while now");
    already_decaying.importance = Some(0.1);
    already_decaying.confidence = Some(0.9);
    already_decaying.state = MemoryState::Decaying;
    already_decaying.updated_at = now - chrono::Duration::days(120);
    store.create_memory(&already_decaying).unwrap();

    // Both memories are flagged for review (first dream for this anima
    // marks every active memory "recent"), so deep sleep needs a scripted
    // KEEP for each; order doesn't matter since KEEP is a no-op either way.
    let review_response = r#"[
        {"index": 0, "action": "KEEP", "reasoning": "fine"},
        {"index": 1, "action": "KEEP", "reasoning": "fine"}
    ]"#;
    let collaborators = seed_collaborators(vec![review_response.to_string()]);

    let session = dream::start_session(&store, anima.user_id, anima.id, DreamTrigger::Scheduled, None).unwrap();
    let result = dream::run_dream(&store, &collaborators, anima.user_id, anima.id, session, DreamConfig::default())
        .await
        .unwrap();

    assert_eq!(result.status, DreamStatus::Completed);

    let aging_after = store.get_memory(aging.id, false).unwrap().unwrap();
    assert_eq!(aging_after.state, MemoryState::Decaying);
    assert!(aging_after.decay_score.unwrap() > 0.7);

    let decaying_after = store.get_memory(already_decaying.id, false).unwrap().unwrap();
    assert_eq!(decaying_after.state, MemoryState::Archived);
}

#[tokio::test]
async fn a_second_concurrent_dream_session_is_rejected() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();

    let _first = dream::start_session(&store, anima.user_id, anima.id, DreamTrigger::Manual, None).unwrap();
    let second = dream::start_session(&store, anima.user_id, anima.id, DreamTrigger::Manual, None);
    assert!(matches!(second, Err(ltam_core::CoreError::Duplicate { kind: "dream_session", .. })));
}
