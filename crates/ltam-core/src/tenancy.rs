//! Row-level tenancy envelope (§4.3).
//!
//! `rusqlite` has no RLS primitive, so the envelope is reimplemented at the
//! application layer: a [`TenantSession`] tags every store call it
//! forwards with the resolved owner and rejects access to anything else.
//! [`Store`] already serializes every call through one `Mutex<Connection>`
//! and makes its multi-statement operations (cascade delete/restore, the
//! synthesis persist step, dream merges) atomic by holding that lock for
//! their whole duration — a `TenantSession` doesn't additionally wrap a
//! `BEGIN`/`COMMIT` around the closure body, since doing so while also
//! routing individual calls back through `Store`'s own locking methods
//! would self-deadlock on one connection. This is a documented
//! simplification of spec §4.3's literal "hold one transaction for the
//! whole scope" framing (see DESIGN.md): the unit of atomicity is the
//! individual `Store` method, not the session.

use crate::entities::EntityKind;
use crate::error::{CoreError, Result};
use crate::ids::{AnimaId, EventId, KnowledgeId, MemoryId, UserId};
use crate::store::Store;

/// Privileged owner lookup, bypassing any tenancy filter (none can be
/// applied yet — the filter needs the answer this function provides).
pub fn resolve_owner(store: &Store, kind: EntityKind, id: uuid::Uuid) -> Result<Option<UserId>> {
    let owner = match kind {
        EntityKind::Anima => store.resolve_anima_owner(AnimaId::from_uuid(id))?,
        EntityKind::Memory => store.resolve_memory_owner(MemoryId::from_uuid(id))?,
        EntityKind::Event => store.resolve_event_owner(EventId::from_uuid(id))?,
        EntityKind::Knowledge => store.resolve_knowledge_owner(KnowledgeId::from_uuid(id))?,
    };
    Ok(owner)
}

/// A tenant-scoped handle: the resolved owner plus the store it reads and
/// writes through. Every entity-scoped helper that takes a `TenantSession`
/// checks ownership before touching the row, so an anima (or anything
/// beneath it) belonging to a different user reads identically to one
/// that does not exist.
pub struct TenantSession<'a> {
    user_id: UserId,
    store: &'a Store,
}

impl<'a> TenantSession<'a> {
    /// Visible crate-wide so async call sites (the pack compiler, synthesis,
    /// dream workflows) can construct a session directly rather than
    /// routing through [`run_in_tenant_session`], whose closure body cannot
    /// hold an `.await`.
    pub(crate) fn new(user_id: UserId, store: &'a Store) -> Self {
        Self { user_id, store }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn store(&self) -> &'a Store {
        self.store
    }

    /// Raises [`CoreError::NotFound`] unless `anima_id` both exists and is
    /// owned by this session's user.
    pub fn check_anima_owned(&self, anima_id: AnimaId) -> Result<()> {
        match self.store.resolve_anima_owner(anima_id)? {
            Some(owner) if owner == self.user_id => Ok(()),
            _ => Err(CoreError::NotFound {
                kind: "anima",
                id: anima_id.to_string(),
            }),
        }
    }

    pub fn check_memory_owned(&self, memory_id: MemoryId) -> Result<()> {
        match self.store.resolve_memory_owner(memory_id)? {
            Some(owner) if owner == self.user_id => Ok(()),
            _ => Err(CoreError::NotFound {
                kind: "memory",
                id: memory_id.to_string(),
            }),
        }
    }

    pub fn check_knowledge_owned(&self, knowledge_id: KnowledgeId) -> Result<()> {
        match self.store.resolve_knowledge_owner(knowledge_id)? {
            Some(owner) if owner == self.user_id => Ok(()),
            _ => Err(CoreError::NotFound {
                kind: "knowledge",
                id: knowledge_id.to_string(),
            }),
        }
    }
}

/// Opens a [`TenantSession`] for `user_id` against `store` and runs `body`.
/// There is nothing to commit or roll back at this level — each `Store`
/// call `body` makes through the session is already its own atomic unit;
/// a sequence that must succeed or fail together (e.g. "create this memory
/// and link these events") is exposed as one dedicated `Store` method
/// rather than assembled from several calls here.
pub fn run_in_tenant_session<T>(
    store: &Store,
    user_id: UserId,
    body: impl FnOnce(&TenantSession) -> Result<T>,
) -> Result<T> {
    let session = TenantSession::new(user_id, store);
    body(&session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Anima;
    use crate::ids::OrganizationId;

    #[test]
    fn resolve_owner_roundtrips_for_anima() {
        let store = Store::open_in_memory().unwrap();
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let owner = resolve_owner(&store, EntityKind::Anima, anima.id.as_uuid()).unwrap();
        assert_eq!(owner, Some(anima.user_id));
    }

    #[test]
    fn resolve_owner_missing_entity_is_none() {
        let store = Store::open_in_memory().unwrap();
        let owner = resolve_owner(&store, EntityKind::Anima, uuid::Uuid::new_v4()).unwrap();
        assert!(owner.is_none());
    }

    #[test]
    fn session_rejects_foreign_anima() {
        let store = Store::open_in_memory().unwrap();
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let other_user = UserId::new();
        let result = run_in_tenant_session(&store, other_user, |session| session.check_anima_owned(anima.id));
        assert!(matches!(result, Err(CoreError::NotFound { kind: "anima", .. })));
    }

    #[test]
    fn session_allows_owning_user() {
        let store = Store::open_in_memory().unwrap();
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let result = run_in_tenant_session(&store, anima.user_id, |session| session.check_anima_owned(anima.id));
        assert!(result.is_ok());
    }
}
