//! Memory-pack compile journey (spec §8, scenario S6): an empty session
//! window falls back to the temporal-context sentence, and identity
//! prose is included when an identity self-model exists.

use chrono::Utc;
use ltam_core::collaborators::testing::DeterministicEmbeddingClient;
use ltam_core::entities::{Anima, Event, EventType, IdentitySelfModel, Memory, MemoryEvent};
use ltam_core::ids::{OrganizationId, UserId};
use ltam_core::pack::{self, RetrievalConfig};
use ltam_core::store::Store;

#[tokio::test]
async fn empty_session_window_falls_back_to_temporal_context() {
    let store = Store::open_in_memory().unwrap();
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();

    let memory = Memory::new(anima.id, "long discussion about the project deadline", "project deadline");
    store.create_memory(&memory).unwrap();

    let mut event = Event::new(anima.id, EventType::MessageIn, "are we still on track?");
    event.occurred_at = Utc::now() - chrono::Duration::hours(50);
    store.create_event(&event).unwrap();
    store.create_memory_event(&MemoryEvent::new(memory.id, event.id)).unwrap();

    let embedding = DeterministicEmbeddingClient::default();
    let config = RetrievalConfig::conversational();

    let compiled = pack::compile_for_user(&store, &embedding, anima.user_id, anima.id, &config).await.unwrap();

    assert!(compiled.session_memories.is_empty());
    let context = compiled.temporal_context.expect("temporal context computed when session window is empty");
    assert_eq!(context.formatted, "Your last communication with the user was 2 days ago about project deadline.");
    assert!(compiled.prompt.contains("2 days ago"));
}

#[tokio::test]
async fn identity_prose_is_included_when_an_identity_exists() {
    let store = Store::open_in_memory().unwrap();
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();

    let identity = IdentitySelfModel::new(anima.id, "a helpful coding assistant");
    store.save_identity(&identity).unwrap();

    let embedding = DeterministicEmbeddingClient::default();
    let config = RetrievalConfig::conversational();

    let compiled = pack::compile_for_user(&store, &embedding, anima.user_id, anima.id, &config).await.unwrap();

    assert!(compiled.identity_prose.is_some());
    assert!(compiled.prompt.contains("helpful coding assistant"));
}

#[tokio::test]
async fn compile_for_user_rejects_a_foreign_anima() {
    let store = Store::open_in_memory().unwrap();
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();

    let embedding = DeterministicEmbeddingClient::default();
    let config = RetrievalConfig::conversational();
    let other_user = UserId::new();

    let result = pack::compile_for_user(&store, &embedding, other_user, anima.id, &config).await;
    assert!(matches!(result, Err(ltam_core::CoreError::NotFound { kind: "anima", .. })));
}
