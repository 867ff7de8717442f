//! Tenancy and cascade invariants (spec §8, invariants 2 and 6; "dedupe
//! round-trip" law): a provenance link is unique per (memory, event) pair,
//! a duplicate dedupe key is rejected at the store layer, and cascade
//! soft-delete/restore of an anima flips default visibility for its
//! children without destroying them.

use chrono::Utc;
use ltam_core::entities::{Anima, Event, EventType, Memory, MemoryEvent};
use ltam_core::ids::{OrganizationId, UserId};
use ltam_core::store::{Store, StoreError};
use ltam_core::tenancy::{self, run_in_tenant_session};

#[test]
fn memory_event_link_pair_is_unique() {
    let store = Store::open_in_memory().unwrap();
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();

    let memory = Memory::new(anima.id, "content", "summary");
    store.create_memory(&memory).unwrap();
    let event = Event::new(anima.id, EventType::MessageIn, "hi");
    store.create_event(&event).unwrap();

    store.create_memory_event(&MemoryEvent::new(memory.id, event.id)).unwrap();
    let duplicate = store.create_memory_event(&MemoryEvent::new(memory.id, event.id));
    assert!(matches!(duplicate, Err(StoreError::Constraint(_))));
}

#[test]
fn dedupe_key_round_trips_to_exactly_one_event_row() {
    let store = Store::open_in_memory().unwrap();
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();

    let occurred_at = Utc::now();
    let dedupe_key = Event::compute_dedupe_key(anima.id, &EventType::MessageIn, "hello world", occurred_at, None);

    let mut first = Event::new(anima.id, EventType::MessageIn, "hello world");
    first.occurred_at = occurred_at;
    first.dedupe_key = Some(dedupe_key.clone());
    store.create_event(&first).unwrap();

    let mut second = Event::new(anima.id, EventType::MessageIn, "hello world");
    second.occurred_at = occurred_at;
    second.dedupe_key = Some(dedupe_key);
    let result = store.create_event(&second);
    assert!(matches!(result, Err(StoreError::Constraint(_))));

    let events = store.list_events(anima.id, None, None, None, false, 100).unwrap();
    assert_eq!(events.len(), 1);
}

#[test]
fn cascade_soft_delete_hides_children_by_default_and_restore_reverses_it() {
    let store = Store::open_in_memory().unwrap();
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();

    let memory = Memory::new(anima.id, "content", "summary");
    store.create_memory(&memory).unwrap();
    let event = Event::new(anima.id, EventType::MessageIn, "hi");
    store.create_event(&event).unwrap();

    store.cascade_soft_delete_anima(anima.id, Utc::now()).unwrap();

    assert!(store.get_anima(anima.id, false).unwrap().is_none());
    assert!(store.get_anima(anima.id, true).unwrap().is_some());
    assert!(store.get_memory(memory.id, false).unwrap().is_none());
    assert!(store.get_memory(memory.id, true).unwrap().is_some());
    assert!(store.get_event(event.id, false).unwrap().is_none());
    assert!(store.get_event(event.id, true).unwrap().is_some());

    store.cascade_restore_anima(anima.id, Utc::now()).unwrap();

    assert!(store.get_anima(anima.id, false).unwrap().is_some());
    assert!(store.get_memory(memory.id, false).unwrap().is_some());
    assert!(store.get_event(event.id, false).unwrap().is_some());
}

#[test]
fn tenant_session_rejects_entities_owned_by_another_user() {
    let store = Store::open_in_memory().unwrap();
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();
    let memory = Memory::new(anima.id, "content", "summary");
    store.create_memory(&memory).unwrap();

    let stranger = UserId::new();
    let result = run_in_tenant_session(&store, stranger, |session| {
        session.check_anima_owned(anima.id)?;
        session.check_memory_owned(memory.id)
    });
    assert!(matches!(result, Err(ltam_core::CoreError::NotFound { kind: "anima", .. })));

    let owner_result = run_in_tenant_session(&store, anima.user_id, |session| {
        session.check_anima_owned(anima.id)?;
        session.check_memory_owned(memory.id)
    });
    assert!(owner_result.is_ok());
}

#[test]
fn resolve_owner_is_none_for_a_soft_deleted_anima_without_include_deleted() {
    let store = Store::open_in_memory().unwrap();
    let anima = Anima::new(UserId::new(), OrganizationId::new(), "assistant");
    store.create_anima(&anima).unwrap();
    store.cascade_soft_delete_anima(anima.id, Utc::now()).unwrap();

    // resolve_owner is the privileged lookup used to open a tenant session
    // in the first place; a soft-deleted anima should resolve to no owner
    // so a caller can't stand up a session against a gone entity.
    let owner = tenancy::resolve_owner(&store, ltam_core::entities::EntityKind::Anima, anima.id.as_uuid()).unwrap();
    assert!(owner.is_none());
}
