//! Synthesis journey (spec §8, scenario S3): a handful of raw events
//! accumulate past the threshold gate, one memory comes out the other
//! side linked to every source event, and the auto-knowledge hook fires.

use std::sync::Arc;

use chrono::Utc;
use ltam_core::collaborators::testing::{DeterministicEmbeddingClient, ScriptedLlmClient};
use ltam_core::entities::{Anima, Event, EventType};
use ltam_core::ids::{OrganizationId, UserId};
use ltam_core::store::Store;
use ltam_core::synthesis::{self, SynthesisOutcome, SynthesisThresholds};
use ltam_core::Collaborators;

fn seed_collaborators(llm_responses: Vec<String>) -> Arc<Collaborators> {
    Arc::new(Collaborators {
        embedding: Arc::new(DeterministicEmbeddingClient::default()),
        llm: Arc::new(ScriptedLlmClient::in_order(llm_responses)),
        background_jobs_enabled: false,
    })
}

#[tokio::test]
async fn three_events_synthesize_into_one_linked_memory() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();

    let t0 = Utc::now() - chrono::Duration::minutes(30);
    let mut event_ids = Vec::new();
    for (i, content) in ["hi there", "can you help with rust lifetimes", "sure, here's an example"].into_iter().enumerate() {
        let mut event = Event::new(anima.id, EventType::MessageIn, content);
        event.occurred_at = t0 + chrono::Duration::minutes(i as i64);
        store.create_event(&event).unwrap();
        event_ids.push(event.id);
    }

    let llm_response = r#"{"summary": "S", "content": "C", "importance": 0.6, "confidence": 0.7}"#;
    let collaborators = seed_collaborators(vec![llm_response.to_string()]);
    let thresholds = SynthesisThresholds {
        threshold: 0.0,
        ..SynthesisThresholds::default()
    };

    let outcome = synthesis::run_synthesis(&store, &collaborators, anima.user_id, anima.id, &thresholds)
        .await
        .unwrap();

    let SynthesisOutcome::Synthesized { memory_id, source_event_count } = outcome else {
        panic!("expected synthesis to proceed, got {outcome:?}");
    };
    assert_eq!(source_event_count, 3);

    let memory = store.get_memory(memory_id, false).unwrap().unwrap();
    assert_eq!(memory.summary, "S");
    assert_eq!(memory.content, "C");
    assert_eq!(memory.importance, Some(0.6));
    assert_eq!(memory.confidence, Some(0.7));
    assert_eq!(memory.time_start, t0);
    assert_eq!(memory.time_end, t0 + chrono::Duration::minutes(2));

    let links = store.list_memory_events_for_memory(memory_id).unwrap();
    assert_eq!(links.len(), 3);
    let linked_event_ids: Vec<_> = links.iter().map(|l| l.event_id).collect();
    for id in event_ids {
        assert!(linked_event_ids.contains(&id));
    }
}

#[tokio::test]
async fn quiet_anima_skips_twice_and_advances_its_baseline() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();
    let thresholds = SynthesisThresholds::default();
    let collaborators = seed_collaborators(vec![]);

    let first = synthesis::run_synthesis(&store, &collaborators, anima.user_id, anima.id, &thresholds).await.unwrap();
    assert_eq!(first, SynthesisOutcome::Skipped { reason: "no_events" });
    let after_first = store.get_anima(anima.id, false).unwrap().unwrap();
    let baseline_after_first = after_first.last_synthesis_check_at.expect("baseline advanced");

    let second = synthesis::run_synthesis(&store, &collaborators, anima.user_id, anima.id, &thresholds).await.unwrap();
    assert_eq!(second, SynthesisOutcome::Skipped { reason: "no_events" });
    let after_second = store.get_anima(anima.id, false).unwrap().unwrap();
    assert!(after_second.last_synthesis_check_at.unwrap() >= baseline_after_first);
}
