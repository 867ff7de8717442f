//! Pack-retention janitor (§4.9).

use crate::error::Result;
use crate::ids::AnimaId;
use crate::store::Store;

/// Default packs retained per anima, unless a caller overrides it.
pub const DEFAULT_MAX_PACKS: u32 = 100;

/// Deletes every pack for `anima_id` except the `max_packs` newest by
/// `compiled_at`, returning the number removed.
pub fn enforce_retention(store: &Store, anima_id: AnimaId, max_packs: u32) -> Result<u64> {
    let deleted = store.enforce_pack_retention(anima_id, max_packs)?;
    if deleted > 0 {
        tracing::debug!(anima = %anima_id, deleted, "enforced memory pack retention");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Anima, MemoryPack};
    use crate::ids::{MemoryPackId, OrganizationId, UserId};
    use chrono::Utc;

    #[test]
    fn retention_keeps_newest_packs() {
        let store = Store::open_in_memory().unwrap();
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        for i in 0..10 {
            let pack = MemoryPack {
                id: MemoryPackId::new(),
                anima_id: anima.id,
                query: None,
                preset: None,
                session_count: 0,
                knowledge_count: 0,
                long_term_count: 0,
                token_count: 0,
                max_tokens: 0,
                content: serde_json::json!({}),
                compiled_at: Utc::now() + chrono::Duration::seconds(i),
            };
            store.create_memory_pack(&pack).unwrap();
        }

        let deleted = enforce_retention(&store, anima.id, 4).unwrap();
        assert_eq!(deleted, 6);
        assert_eq!(store.count_memory_packs(anima.id).unwrap(), 4);
    }
}
