//! Persisted entity store (§4.2).
//!
//! A `rusqlite`-backed repository over every entity in [`crate::entities`].
//! Universal rules enforced here: mutations are staged on the connection
//! the caller hands in (see [`crate::tenancy`] for the transaction
//! boundary), soft delete flips `is_deleted` rather than removing the row,
//! and `get_*` treats "absent" and "soft-deleted without `include_deleted`"
//! identically by simply returning `None` — callers decide whether that
//! collapses to [`crate::error::CoreError::NotFound`] or
//! [`crate::error::CoreError::Deleted`].

mod migrations;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::entities::*;
use crate::ids::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("constraint violation: {0}")]
    Constraint(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Per-table row counts produced by a cascade soft-delete or restore.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CascadeCounts {
    pub memory_events: u64,
    pub synthesis_configs: u64,
    pub io_configs: u64,
    pub identities: u64,
    pub knowledge: u64,
    pub memories: u64,
    pub events: u64,
    pub animas: u64,
}

/// The entity store. One `Store` wraps one SQLite connection guarded by a
/// mutex; callers serialize access to it through [`crate::tenancy`] so that
/// a single owner-scoped transaction never races with another.
pub struct Store {
    conn: Mutex<Connection>,
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for f in vector {
        bytes.extend_from_slice(&f.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl Store {
    /// Opens (creating if absent) a database file at `path` and applies any
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// An in-memory database, used by tests and by short-lived CLI runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        )?;
        let current: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;
        for migration in migrations::MIGRATIONS {
            if migration.version > current {
                conn.execute_batch(migration.up)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![migration.version],
                )?;
                tracing::info!(version = migration.version, description = migration.description, "applied migration");
            }
        }
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Anima
    // ------------------------------------------------------------------

    pub fn create_anima(&self, anima: &Anima) -> Result<()> {
        self.conn().execute(
            "INSERT INTO animas (id, user_id, organization_id, name, description, metadata,
                is_dormant, last_activity_at, last_synthesis_check_at, is_deleted, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                anima.id,
                anima.user_id,
                anima.organization_id,
                anima.name,
                anima.description,
                anima.metadata,
                anima.is_dormant,
                anima.last_activity_at,
                anima.last_synthesis_check_at,
                anima.is_deleted,
                anima.created_at,
                anima.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_anima(&self, id: AnimaId, include_deleted: bool) -> Result<Option<Anima>> {
        let conn = self.conn();
        let sql = if include_deleted {
            "SELECT * FROM animas WHERE id = ?1"
        } else {
            "SELECT * FROM animas WHERE id = ?1 AND is_deleted = 0"
        };
        conn.query_row(sql, params![id], row_to_anima).optional().map_err(Into::into)
    }

    pub fn list_animas_by_user(&self, user_id: UserId, include_deleted: bool) -> Result<Vec<Anima>> {
        let conn = self.conn();
        let sql = if include_deleted {
            "SELECT * FROM animas WHERE user_id = ?1 ORDER BY created_at DESC"
        } else {
            "SELECT * FROM animas WHERE user_id = ?1 AND is_deleted = 0 ORDER BY created_at DESC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![user_id], row_to_anima)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Every non-deleted, non-dormant anima across every tenant. Used only
    /// by the scheduler's periodic sweeps, which run with no user context
    /// of their own — every other caller goes through a [`crate::tenancy`]
    /// check instead.
    pub fn list_active_animas(&self) -> Result<Vec<Anima>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM animas WHERE is_deleted = 0 AND is_dormant = 0 ORDER BY id")?;
        let rows = stmt.query_map([], row_to_anima)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn save_anima(&self, anima: &Anima) -> Result<()> {
        self.conn().execute(
            "UPDATE animas SET name=?2, description=?3, metadata=?4, is_dormant=?5,
                last_activity_at=?6, last_synthesis_check_at=?7, is_deleted=?8, updated_at=?9 WHERE id=?1",
            params![
                anima.id,
                anima.name,
                anima.description,
                anima.metadata,
                anima.is_dormant,
                anima.last_activity_at,
                anima.last_synthesis_check_at,
                anima.is_deleted,
                anima.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Advances `last_synthesis_check_at` to `at` without touching the rest
    /// of the row; the threshold gate (§4.6) calls this both when it
    /// proceeds and when it skips for lack of new events.
    pub fn touch_synthesis_check(&self, anima_id: AnimaId, at: DateTime<Utc>) -> Result<()> {
        self.conn()
            .execute("UPDATE animas SET last_synthesis_check_at=?2 WHERE id=?1", params![anima_id, at])?;
        Ok(())
    }

    /// Cascade soft-delete: hard-delete junctions and 1:1 configs; soft-delete
    /// identities, knowledge, memories, events; then the anima itself.
    pub fn cascade_soft_delete_anima(&self, anima_id: AnimaId, now: DateTime<Utc>) -> Result<CascadeCounts> {
        let conn = self.conn();
        let mut counts = CascadeCounts::default();

        counts.memory_events = conn.execute(
            "DELETE FROM memory_events WHERE memory_id IN (SELECT id FROM memories WHERE anima_id=?1)",
            params![anima_id],
        )? as u64;
        counts.synthesis_configs = conn
            .execute("DELETE FROM synthesis_configs WHERE anima_id=?1", params![anima_id])? as u64;
        counts.io_configs =
            conn.execute("DELETE FROM io_configs WHERE anima_id=?1", params![anima_id])? as u64;
        counts.identities = conn.execute(
            "UPDATE identities SET is_deleted=1, updated_at=?2 WHERE anima_id=?1 AND is_deleted=0",
            params![anima_id, now],
        )? as u64;
        counts.knowledge = conn.execute(
            "UPDATE knowledge SET is_deleted=1, updated_at=?2 WHERE anima_id=?1 AND is_deleted=0",
            params![anima_id, now],
        )? as u64;
        counts.memories = conn.execute(
            "UPDATE memories SET is_deleted=1, updated_at=?2 WHERE anima_id=?1 AND is_deleted=0",
            params![anima_id, now],
        )? as u64;
        counts.events = conn.execute(
            "UPDATE events SET is_deleted=1, updated_at=?2 WHERE anima_id=?1 AND is_deleted=0",
            params![anima_id, now],
        )? as u64;
        counts.animas = conn.execute(
            "UPDATE animas SET is_deleted=1, updated_at=?2 WHERE id=?1 AND is_deleted=0",
            params![anima_id, now],
        )? as u64;

        Ok(counts)
    }

    /// Reverses the soft-deletions and re-materializes the hard-deleted
    /// 1:1 configs with their defaults.
    pub fn cascade_restore_anima(&self, anima_id: AnimaId, now: DateTime<Utc>) -> Result<CascadeCounts> {
        let conn = self.conn();
        let mut counts = CascadeCounts::default();

        counts.animas =
            conn.execute("UPDATE animas SET is_deleted=0, updated_at=?2 WHERE id=?1", params![anima_id, now])? as u64;
        counts.events = conn.execute(
            "UPDATE events SET is_deleted=0, updated_at=?2 WHERE anima_id=?1",
            params![anima_id, now],
        )? as u64;
        counts.memories = conn.execute(
            "UPDATE memories SET is_deleted=0, updated_at=?2 WHERE anima_id=?1",
            params![anima_id, now],
        )? as u64;
        counts.knowledge = conn.execute(
            "UPDATE knowledge SET is_deleted=0, updated_at=?2 WHERE anima_id=?1",
            params![anima_id, now],
        )? as u64;
        counts.identities = conn.execute(
            "UPDATE identities SET is_deleted=0, updated_at=?2 WHERE anima_id=?1",
            params![anima_id, now],
        )? as u64;

        let synthesis_default = SynthesisConfig::default_for(anima_id);
        counts.synthesis_configs = conn.execute(
            "INSERT OR IGNORE INTO synthesis_configs (anima_id, time_weight, event_weight, token_weight,
                threshold, llm_temperature, max_tokens, scheduler_interval_hours,
                last_synthesis_check_at, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                synthesis_default.anima_id,
                synthesis_default.time_weight,
                synthesis_default.event_weight,
                synthesis_default.token_weight,
                synthesis_default.threshold,
                synthesis_default.llm_temperature,
                synthesis_default.max_tokens,
                synthesis_default.scheduler_interval_hours,
                synthesis_default.last_synthesis_check_at,
                synthesis_default.created_at,
                synthesis_default.updated_at,
            ],
        )? as u64;

        let io_default = IoConfig::default_for(anima_id);
        counts.io_configs = conn.execute(
            "INSERT OR IGNORE INTO io_configs (anima_id, read_settings, write_settings, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5)",
            params![
                io_default.anima_id,
                io_default.read_settings,
                io_default.write_settings,
                io_default.created_at,
                io_default.updated_at,
            ],
        )? as u64;

        Ok(counts)
    }

    // ------------------------------------------------------------------
    // Event
    // ------------------------------------------------------------------

    pub fn create_event(&self, event: &Event) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO events (id, anima_id, event_type, role, author, content, summary,
                occurred_at, session, metadata, source_uri, dedupe_key, importance,
                is_deleted, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            params![
                event.id,
                event.anima_id,
                event.event_type.as_str(),
                event.role,
                event.author,
                event.content,
                event.summary,
                event.occurred_at,
                event.session,
                event.metadata,
                event.source_uri,
                event.dedupe_key,
                event.importance,
                event.is_deleted,
                event.created_at,
                event.updated_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, ref msg))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Constraint(msg.clone().unwrap_or_else(|| "unique violation".into())))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_event(&self, id: EventId, include_deleted: bool) -> Result<Option<Event>> {
        let conn = self.conn();
        let sql = if include_deleted {
            "SELECT * FROM events WHERE id = ?1"
        } else {
            "SELECT * FROM events WHERE id = ?1 AND is_deleted = 0"
        };
        conn.query_row(sql, params![id], row_to_event).optional().map_err(Into::into)
    }

    /// Filtered listing per the `(anima, type, session, min_importance,
    /// include_deleted)` route shape, newest first.
    pub fn list_events(
        &self,
        anima_id: AnimaId,
        event_type: Option<&EventType>,
        session: Option<&str>,
        min_importance: Option<f64>,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let conn = self.conn();
        let mut sql = String::from("SELECT * FROM events WHERE anima_id = ?1");
        if !include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }
        if event_type.is_some() {
            sql.push_str(" AND event_type = ?2");
        }
        if session.is_some() {
            sql.push_str(" AND session = ?3");
        }
        if min_importance.is_some() {
            sql.push_str(" AND importance >= ?4");
        }
        sql.push_str(" ORDER BY occurred_at DESC LIMIT ?5");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                anima_id,
                event_type.map(|t| t.as_str()),
                session,
                min_importance,
                limit as i64,
            ],
            row_to_event,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Events strictly after `baseline`, chronological, non-deleted — the
    /// event-collection step of the synthesis pipeline (§4.6).
    pub fn list_events_since(&self, anima_id: AnimaId, baseline: DateTime<Utc>) -> Result<Vec<Event>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM events WHERE anima_id = ?1 AND occurred_at > ?2 AND is_deleted = 0
             ORDER BY occurred_at ASC",
        )?;
        let rows = stmt.query_map(params![anima_id, baseline], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn count_events_since(&self, anima_id: AnimaId, baseline: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE anima_id = ?1 AND occurred_at > ?2 AND is_deleted = 0",
            params![anima_id, baseline],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn save_event(&self, event: &Event) -> Result<()> {
        self.conn().execute(
            "UPDATE events SET summary=?2, metadata=?3, importance=?4, is_deleted=?5, updated_at=?6
             WHERE id=?1",
            params![
                event.id,
                event.summary,
                event.metadata,
                event.importance,
                event.is_deleted,
                event.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Most recent non-deleted `message.in`/`message.out` event for an
    /// anima, left-joined to its linked memory's summary if any (§4.4
    /// temporal context helper).
    pub fn latest_message_with_memory_summary(
        &self,
        anima_id: AnimaId,
    ) -> Result<Option<(Event, Option<String>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.*, m.summary as memory_summary
             FROM events e
             LEFT JOIN memory_events me ON me.event_id = e.id
             LEFT JOIN memories m ON m.id = me.memory_id AND m.is_deleted = 0
             WHERE e.anima_id = ?1 AND e.is_deleted = 0
               AND e.event_type IN ('message.in', 'message.out')
             ORDER BY e.occurred_at DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![anima_id], |row| {
                let event = row_to_event(row)?;
                let summary: Option<String> = row.get("memory_summary")?;
                Ok((event, summary))
            })
            .optional()?;
        Ok(row)
    }

    // ------------------------------------------------------------------
    // MemoryEvent links
    // ------------------------------------------------------------------

    pub fn create_memory_event(&self, link: &MemoryEvent) -> Result<()> {
        self.conn().execute(
            "INSERT INTO memory_events (id, memory_id, event_id, link_strength, created_at)
             VALUES (?1,?2,?3,?4,?5)",
            params![link.id, link.memory_id, link.event_id, link.link_strength, link.created_at],
        )?;
        Ok(())
    }

    pub fn create_memory_events_bulk(&self, links: &[MemoryEvent]) -> Result<()> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "INSERT INTO memory_events (id, memory_id, event_id, link_strength, created_at)
             VALUES (?1,?2,?3,?4,?5)",
        )?;
        for link in links {
            stmt.execute(params![link.id, link.memory_id, link.event_id, link.link_strength, link.created_at])?;
        }
        Ok(())
    }

    pub fn list_memory_events_for_memory(&self, memory_id: MemoryId) -> Result<Vec<MemoryEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM memory_events WHERE memory_id = ?1")?;
        let rows = stmt.query_map(params![memory_id], row_to_memory_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn list_source_events_for_memory(&self, memory_id: MemoryId) -> Result<Vec<Event>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.* FROM events e
             JOIN memory_events me ON me.event_id = e.id
             WHERE me.memory_id = ?1 AND e.is_deleted = 0
             ORDER BY e.occurred_at ASC",
        )?;
        let rows = stmt.query_map(params![memory_id], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Atomic persist step for the synthesis pipeline (§4.6): inserts
    /// `memory` and links every id in `source_event_ids` in one locked,
    /// single-transaction pass, so a crash between the two inserts can
    /// never leave a memory with a partial provenance trail.
    pub fn persist_synthesized_memory(&self, memory: &Memory, source_event_ids: &[EventId]) -> Result<()> {
        let (embedding, model) = match &memory.embedding {
            Some(e) => (Some(encode_embedding(&e.vector)), Some(e.model.clone())),
            None => (None, None),
        };
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO memories (id, anima_id, content, summary, importance, confidence, state,
                recency_score, decay_score, time_start, time_end, metadata, embedding, embedding_model,
                is_deleted, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                memory.id,
                memory.anima_id,
                memory.content,
                memory.summary,
                memory.importance,
                memory.confidence,
                memory.state.as_str(),
                memory.recency_score,
                memory.decay_score,
                memory.time_start,
                memory.time_end,
                memory.metadata,
                embedding,
                model,
                memory.is_deleted,
                memory.created_at,
                memory.updated_at,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO memory_events (id, memory_id, event_id, link_strength, created_at)
                 VALUES (?1,?2,?3,?4,?5)",
            )?;
            for event_id in source_event_ids {
                let link = MemoryEvent::new(memory.id, *event_id);
                stmt.execute(params![link.id, link.memory_id, link.event_id, link.link_strength, link.created_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    pub fn create_memory(&self, memory: &Memory) -> Result<()> {
        let (embedding, model) = match &memory.embedding {
            Some(e) => (Some(encode_embedding(&e.vector)), Some(e.model.clone())),
            None => (None, None),
        };
        self.conn().execute(
            "INSERT INTO memories (id, anima_id, content, summary, importance, confidence, state,
                recency_score, decay_score, time_start, time_end, metadata, embedding, embedding_model,
                is_deleted, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                memory.id,
                memory.anima_id,
                memory.content,
                memory.summary,
                memory.importance,
                memory.confidence,
                memory.state.as_str(),
                memory.recency_score,
                memory.decay_score,
                memory.time_start,
                memory.time_end,
                memory.metadata,
                embedding,
                model,
                memory.is_deleted,
                memory.created_at,
                memory.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_memory(&self, id: MemoryId, include_deleted: bool) -> Result<Option<Memory>> {
        let conn = self.conn();
        let sql = if include_deleted {
            "SELECT * FROM memories WHERE id = ?1"
        } else {
            "SELECT * FROM memories WHERE id = ?1 AND is_deleted = 0"
        };
        conn.query_row(sql, params![id], row_to_memory).optional().map_err(Into::into)
    }

    pub fn save_memory(&self, memory: &Memory) -> Result<()> {
        let (embedding, model) = match &memory.embedding {
            Some(e) => (Some(encode_embedding(&e.vector)), Some(e.model.clone())),
            None => (None, None),
        };
        self.conn().execute(
            "UPDATE memories SET content=?2, summary=?3, importance=?4, confidence=?5, state=?6,
                recency_score=?7, decay_score=?8, time_start=?9, time_end=?10, metadata=?11,
                embedding=?12, embedding_model=?13, is_deleted=?14, updated_at=?15
             WHERE id=?1",
            params![
                memory.id,
                memory.content,
                memory.summary,
                memory.importance,
                memory.confidence,
                memory.state.as_str(),
                memory.recency_score,
                memory.decay_score,
                memory.time_start,
                memory.time_end,
                memory.metadata,
                embedding,
                model,
                memory.is_deleted,
                memory.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Time-windowed query (§4.4): filtered by anima, state set, optional
    /// `[min_time, max_time)`, optional importance/confidence floors,
    /// ordered by `created_at` descending.
    #[allow(clippy::too_many_arguments)]
    pub fn list_memories_window(
        &self,
        anima_id: AnimaId,
        states: &[MemoryState],
        min_time: Option<DateTime<Utc>>,
        max_time: Option<DateTime<Utc>>,
        min_importance: Option<f64>,
        min_confidence: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let conn = self.conn();
        let state_list = states
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let state_clause = if states.is_empty() {
            String::new()
        } else {
            format!(" AND state IN ({state_list})")
        };
        // Every optional filter binds its placeholder unconditionally and
        // guards it with an `IS NULL` escape hatch, so the parameter count
        // always matches the six `?N` slots regardless of which filters are
        // actually active.
        let sql = format!(
            "SELECT * FROM memories WHERE anima_id = ?1 AND is_deleted = 0{state_clause}
             AND (?2 IS NULL OR created_at >= ?2)
             AND (?3 IS NULL OR created_at < ?3)
             AND (?4 IS NULL OR importance >= ?4)
             AND (?5 IS NULL OR confidence >= ?5)
             ORDER BY created_at DESC LIMIT ?6"
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![anima_id, min_time, max_time, min_importance, min_confidence, limit as i64],
            row_to_memory,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// All non-deleted memories with an embedding, used as the semantic
    /// search and merge-candidate-detection pre-filter. The in-process
    /// cosine re-rank happens in [`crate::retrieval`]/[`crate::dream`].
    pub fn list_memories_with_embedding(
        &self,
        anima_id: AnimaId,
        states: &[MemoryState],
        max_time: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let conn = self.conn();
        let state_list = states
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let state_clause = if states.is_empty() {
            String::new()
        } else {
            format!(" AND state IN ({state_list})")
        };
        let sql = format!(
            "SELECT * FROM memories WHERE anima_id = ?1 AND is_deleted = 0 AND embedding IS NOT NULL{state_clause}
             AND (?2 IS NULL OR created_at < ?2)
             ORDER BY created_at DESC LIMIT ?3"
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![anima_id, max_time, limit as i64], row_to_memory)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// `created_at` of the most recent non-deleted memory for `anima_id`,
    /// used as one candidate in the synthesis threshold gate's baseline.
    pub fn latest_memory_created_at(&self, anima_id: AnimaId) -> Result<Option<DateTime<Utc>>> {
        self.conn()
            .query_row(
                "SELECT MAX(created_at) FROM memories WHERE anima_id = ?1 AND is_deleted = 0",
                params![anima_id],
                |r| r.get(0),
            )
            .optional()
            .map(Option::flatten)
            .map_err(Into::into)
    }

    pub fn list_active_memories(&self, anima_id: AnimaId) -> Result<Vec<Memory>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM memories WHERE anima_id = ?1 AND is_deleted = 0 AND state = 'active'
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![anima_id], row_to_memory)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Knowledge
    // ------------------------------------------------------------------

    pub fn create_knowledge(&self, item: &KnowledgeItem) -> Result<()> {
        let (embedding, model) = match &item.embedding {
            Some(e) => (Some(encode_embedding(&e.vector)), Some(e.model.clone())),
            None => (None, None),
        };
        self.conn().execute(
            "INSERT INTO knowledge (id, anima_id, knowledge_type, topic, content, summary, confidence,
                source_type, embedding, embedding_model, is_deleted, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                item.id,
                item.anima_id,
                item.knowledge_type.as_str(),
                item.topic,
                item.content,
                item.summary,
                item.confidence,
                knowledge_source_type_str(item.source_type),
                embedding,
                model,
                item.is_deleted,
                item.created_at,
                item.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_knowledge(&self, id: KnowledgeId, include_deleted: bool) -> Result<Option<KnowledgeItem>> {
        let conn = self.conn();
        let sql = if include_deleted {
            "SELECT * FROM knowledge WHERE id = ?1"
        } else {
            "SELECT * FROM knowledge WHERE id = ?1 AND is_deleted = 0"
        };
        conn.query_row(sql, params![id], row_to_knowledge).optional().map_err(Into::into)
    }

    pub fn save_knowledge(&self, item: &KnowledgeItem) -> Result<()> {
        let (embedding, model) = match &item.embedding {
            Some(e) => (Some(encode_embedding(&e.vector)), Some(e.model.clone())),
            None => (None, None),
        };
        self.conn().execute(
            "UPDATE knowledge SET topic=?2, content=?3, summary=?4, confidence=?5, source_type=?6,
                embedding=?7, embedding_model=?8, is_deleted=?9, updated_at=?10 WHERE id=?1",
            params![
                item.id,
                item.topic,
                item.content,
                item.summary,
                item.confidence,
                knowledge_source_type_str(item.source_type),
                embedding,
                model,
                item.is_deleted,
                item.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_knowledge(
        &self,
        anima_id: AnimaId,
        types: Option<&[KnowledgeType]>,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<KnowledgeItem>> {
        let conn = self.conn();
        let mut sql = String::from("SELECT * FROM knowledge WHERE anima_id = ?1");
        if !include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }
        if let Some(types) = types {
            if !types.is_empty() {
                let list = types.iter().map(|t| format!("'{}'", t.as_str())).collect::<Vec<_>>().join(",");
                sql.push_str(&format!(" AND knowledge_type IN ({list})"));
            }
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?2");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![anima_id, limit as i64], row_to_knowledge)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn list_knowledge_with_embedding(
        &self,
        anima_id: AnimaId,
        types: Option<&[KnowledgeType]>,
        limit: usize,
    ) -> Result<Vec<KnowledgeItem>> {
        let conn = self.conn();
        let mut sql =
            String::from("SELECT * FROM knowledge WHERE anima_id = ?1 AND is_deleted = 0 AND embedding IS NOT NULL");
        if let Some(types) = types {
            if !types.is_empty() {
                let list = types.iter().map(|t| format!("'{}'", t.as_str())).collect::<Vec<_>>().join(",");
                sql.push_str(&format!(" AND knowledge_type IN ({list})"));
            }
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?2");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![anima_id, limit as i64], row_to_knowledge)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Ids of knowledge items originally created from `memory_id`, found
    /// via the audit trail rather than a direct column (knowledge rows
    /// don't carry a `memory_id`). The `replace`/`skip` dedupe policies use
    /// this to look up what already exists before deciding what to do with
    /// it; the lookup itself deletes nothing.
    pub fn find_knowledge_ids_by_source_memory(&self, memory_id: MemoryId) -> Result<Vec<KnowledgeId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT knowledge_id FROM knowledge_audit_log
             WHERE source_type = 'memory' AND source_id = ?1 AND action = 'CREATE'",
        )?;
        let ids: Vec<KnowledgeId> = stmt
            .query_map(params![memory_id], |r| r.get::<_, KnowledgeId>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Knowledge audit log
    // ------------------------------------------------------------------

    pub fn create_knowledge_audit_log(&self, log: &KnowledgeAuditLog) -> Result<()> {
        self.conn().execute(
            "INSERT INTO knowledge_audit_log (id, knowledge_id, action, source_type, source_id,
                before_state, after_state, change_summary, trigger, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                log.id,
                log.knowledge_id,
                knowledge_action_str(log.action),
                log.source_type,
                log.source_id,
                log.before,
                log.after,
                log.change_summary,
                log.trigger,
                log.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_knowledge_audit_log(&self, knowledge_id: KnowledgeId) -> Result<Vec<KnowledgeAuditLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM knowledge_audit_log WHERE knowledge_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![knowledge_id], row_to_knowledge_audit_log)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // SynthesisConfig / IoConfig / Identity (1:1 per anima)
    // ------------------------------------------------------------------

    pub fn get_synthesis_config(&self, anima_id: AnimaId) -> Result<Option<SynthesisConfig>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM synthesis_configs WHERE anima_id = ?1",
            params![anima_id],
            row_to_synthesis_config,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Materializes defaults on first access, per §3.
    pub fn get_or_create_synthesis_config(&self, anima_id: AnimaId) -> Result<SynthesisConfig> {
        if let Some(cfg) = self.get_synthesis_config(anima_id)? {
            return Ok(cfg);
        }
        let cfg = SynthesisConfig::default_for(anima_id);
        self.conn().execute(
            "INSERT INTO synthesis_configs (anima_id, time_weight, event_weight, token_weight,
                threshold, llm_temperature, max_tokens, scheduler_interval_hours,
                last_synthesis_check_at, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                cfg.anima_id,
                cfg.time_weight,
                cfg.event_weight,
                cfg.token_weight,
                cfg.threshold,
                cfg.llm_temperature,
                cfg.max_tokens,
                cfg.scheduler_interval_hours,
                cfg.last_synthesis_check_at,
                cfg.created_at,
                cfg.updated_at,
            ],
        )?;
        Ok(cfg)
    }

    pub fn save_synthesis_config(&self, cfg: &SynthesisConfig) -> Result<()> {
        self.conn().execute(
            "UPDATE synthesis_configs SET time_weight=?2, event_weight=?3, token_weight=?4,
                threshold=?5, llm_temperature=?6, max_tokens=?7, scheduler_interval_hours=?8,
                last_synthesis_check_at=?9, updated_at=?10 WHERE anima_id=?1",
            params![
                cfg.anima_id,
                cfg.time_weight,
                cfg.event_weight,
                cfg.token_weight,
                cfg.threshold,
                cfg.llm_temperature,
                cfg.max_tokens,
                cfg.scheduler_interval_hours,
                cfg.last_synthesis_check_at,
                cfg.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_or_create_io_config(&self, anima_id: AnimaId) -> Result<IoConfig> {
        let conn = self.conn();
        let existing = conn
            .query_row(
                "SELECT * FROM io_configs WHERE anima_id = ?1",
                params![anima_id],
                row_to_io_config,
            )
            .optional()?;
        drop(conn);
        if let Some(cfg) = existing {
            return Ok(cfg);
        }
        let cfg = IoConfig::default_for(anima_id);
        self.conn().execute(
            "INSERT INTO io_configs (anima_id, read_settings, write_settings, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5)",
            params![cfg.anima_id, cfg.read_settings, cfg.write_settings, cfg.created_at, cfg.updated_at],
        )?;
        Ok(cfg)
    }

    pub fn save_io_config(&self, cfg: &IoConfig) -> Result<()> {
        self.conn().execute(
            "UPDATE io_configs SET read_settings=?2, write_settings=?3, updated_at=?4 WHERE anima_id=?1",
            params![cfg.anima_id, cfg.read_settings, cfg.write_settings, cfg.updated_at],
        )?;
        Ok(())
    }

    pub fn get_identity(&self, anima_id: AnimaId) -> Result<Option<IdentitySelfModel>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM identities WHERE anima_id = ?1 AND is_deleted = 0",
            params![anima_id],
            row_to_identity,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn save_identity(&self, identity: &IdentitySelfModel) -> Result<()> {
        self.conn().execute(
            "INSERT INTO identities (anima_id, name, personality_type, communication_style,
                self_reflection, is_deleted, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(anima_id) DO UPDATE SET
                name=excluded.name, personality_type=excluded.personality_type,
                communication_style=excluded.communication_style,
                self_reflection=excluded.self_reflection, is_deleted=excluded.is_deleted,
                updated_at=excluded.updated_at",
            params![
                identity.anima_id,
                identity.name,
                identity.personality_type,
                identity.communication_style,
                identity.self_reflection,
                identity.is_deleted,
                identity.created_at,
                identity.updated_at,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // MemoryPack
    // ------------------------------------------------------------------

    pub fn create_memory_pack(&self, pack: &MemoryPack) -> Result<()> {
        self.conn().execute(
            "INSERT INTO memory_packs (id, anima_id, query, preset, session_count, knowledge_count,
                long_term_count, token_count, max_tokens, content, compiled_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                pack.id,
                pack.anima_id,
                pack.query,
                pack.preset,
                pack.session_count,
                pack.knowledge_count,
                pack.long_term_count,
                pack.token_count,
                pack.max_tokens,
                pack.content,
                pack.compiled_at,
            ],
        )?;
        Ok(())
    }

    pub fn count_memory_packs(&self, anima_id: AnimaId) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_packs WHERE anima_id = ?1",
            params![anima_id],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Deletes every pack for `anima_id` except the `max_packs` newest by
    /// `compiled_at`. Returns the number deleted (§4.9).
    pub fn enforce_pack_retention(&self, anima_id: AnimaId, max_packs: u32) -> Result<u64> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM memory_packs WHERE anima_id = ?1 AND id NOT IN (
                SELECT id FROM memory_packs WHERE anima_id = ?1
                ORDER BY compiled_at DESC LIMIT ?2
             )",
            params![anima_id, max_packs as i64],
        )?;
        Ok(deleted as u64)
    }

    // ------------------------------------------------------------------
    // DreamSession / DreamAction
    // ------------------------------------------------------------------

    pub fn create_dream_session(&self, session: &DreamSession) -> Result<()> {
        self.conn().execute(
            "INSERT INTO dream_sessions (id, anima_id, trigger, triggered_by_user_id, started_at,
                completed_at, status, error_message, memories_reviewed, memories_modified,
                memories_created, memories_archived, memories_deleted, summary, config_snapshot)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                session.id,
                session.anima_id,
                dream_trigger_str(session.trigger),
                session.triggered_by_user_id,
                session.started_at,
                session.completed_at,
                dream_status_str(session.status),
                session.error_message,
                session.memories_reviewed,
                session.memories_modified,
                session.memories_created,
                session.memories_archived,
                session.memories_deleted,
                session.summary,
                session.config_snapshot,
            ],
        )?;
        Ok(())
    }

    pub fn get_dream_session(&self, id: DreamSessionId) -> Result<Option<DreamSession>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM dream_sessions WHERE id = ?1",
            params![id],
            row_to_dream_session,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn save_dream_session(&self, session: &DreamSession) -> Result<()> {
        self.conn().execute(
            "UPDATE dream_sessions SET completed_at=?2, status=?3, error_message=?4,
                memories_reviewed=?5, memories_modified=?6, memories_created=?7,
                memories_archived=?8, memories_deleted=?9, summary=?10 WHERE id=?1",
            params![
                session.id,
                session.completed_at,
                dream_status_str(session.status),
                session.error_message,
                session.memories_reviewed,
                session.memories_modified,
                session.memories_created,
                session.memories_archived,
                session.memories_deleted,
                session.summary,
            ],
        )?;
        Ok(())
    }

    pub fn has_running_dream_session(&self, anima_id: AnimaId) -> Result<bool> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dream_sessions WHERE anima_id = ?1 AND status = 'RUNNING'",
            params![anima_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_dream_sessions(
        &self,
        anima_id: AnimaId,
        status: Option<DreamStatus>,
    ) -> Result<Vec<DreamSession>> {
        let conn = self.conn();
        let mut sql = String::from("SELECT * FROM dream_sessions WHERE anima_id = ?1");
        if status.is_some() {
            sql.push_str(" AND status = ?2");
        }
        sql.push_str(" ORDER BY started_at DESC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![anima_id, status.map(dream_status_str)], row_to_dream_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// `RUNNING` sessions started more than `threshold` ago, across every
    /// anima — feeds the stale-session sweep (§4.7, §5).
    pub fn list_stale_running_sessions(&self, older_than: DateTime<Utc>) -> Result<Vec<DreamSession>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM dream_sessions WHERE status = 'RUNNING' AND started_at < ?1",
        )?;
        let rows = stmt.query_map(params![older_than], row_to_dream_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn most_recent_completed_dream(&self, anima_id: AnimaId) -> Result<Option<DreamSession>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM dream_sessions WHERE anima_id = ?1 AND status = 'COMPLETED'
             ORDER BY completed_at DESC LIMIT 1",
            params![anima_id],
            row_to_dream_session,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn create_dream_action(&self, action: &DreamAction) -> Result<()> {
        let source_ids = serde_json::to_string(&action.source_memory_ids)?;
        let result_ids = action.result_memory_ids.as_ref().map(serde_json::to_string).transpose()?;
        self.conn().execute(
            "INSERT INTO dream_actions (id, session_id, action_type, phase, source_memory_ids,
                result_memory_ids, before_state, after_state, reasoning, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                action.id,
                action.session_id,
                action_type_str(action.action_type),
                dream_phase_str(action.phase),
                source_ids,
                result_ids,
                action.before_state,
                action.after_state,
                action.reasoning,
                action.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_dream_actions(&self, session_id: DreamSessionId) -> Result<Vec<DreamAction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM dream_actions WHERE session_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_dream_action)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // ApiKey
    // ------------------------------------------------------------------

    pub fn create_api_key(&self, key: &ApiKey) -> Result<()> {
        self.conn().execute(
            "INSERT INTO api_keys (id, user_id, name, description, key_hash, public_prefix,
                last_used_at, request_count, is_active, expires_at, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                key.id,
                key.user_id,
                key.name,
                key.description,
                key.key_hash,
                key.public_prefix,
                key.last_used_at,
                key.request_count as i64,
                key.is_active,
                key.expires_at,
                key.created_at,
                key.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_api_key_by_prefix(&self, prefix: &str) -> Result<Option<ApiKey>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM api_keys WHERE public_prefix = ?1",
            params![prefix],
            row_to_api_key,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_api_keys_by_user(&self, user_id: UserId) -> Result<Vec<ApiKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM api_keys WHERE user_id = ?1 ORDER BY created_at DESC")?;
        let rows = stmt.query_map(params![user_id], row_to_api_key)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn save_api_key(&self, key: &ApiKey) -> Result<()> {
        self.conn().execute(
            "UPDATE api_keys SET last_used_at=?2, request_count=?3, is_active=?4, updated_at=?5
             WHERE id=?1",
            params![key.id, key.last_used_at, key.request_count as i64, key.is_active, key.updated_at],
        )?;
        Ok(())
    }

    pub fn delete_api_key(&self, id: ApiKeyId) -> Result<bool> {
        let affected = self.conn().execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // CLI cleanup support (§6 CLI surface)
    // ------------------------------------------------------------------

    /// Deletes all entity data owned by `user_id`'s animas, in FK-safe
    /// order, preserving the user row itself (the user entity lives
    /// outside this crate's data model). Returns per-table counts.
    pub fn purge_user_data(&self, user_id: UserId, dry_run: bool) -> Result<CascadeCounts> {
        let anima_ids = {
            let conn = self.conn();
            let mut stmt = conn.prepare("SELECT id FROM animas WHERE user_id = ?1")?;
            let rows = stmt.query_map(params![user_id], |r| r.get::<_, AnimaId>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut totals = CascadeCounts::default();
        if dry_run {
            for anima_id in anima_ids {
                totals.memories += self.count_memories_for_anima(anima_id)?;
                totals.events += self.count_events_for_anima(anima_id)?;
            }
            totals.animas = 0;
            return Ok(totals);
        }

        for anima_id in anima_ids {
            let conn = self.conn();
            conn.execute(
                "DELETE FROM memory_events WHERE memory_id IN (SELECT id FROM memories WHERE anima_id=?1)",
                params![anima_id],
            )?;
            conn.execute("DELETE FROM dream_actions WHERE session_id IN (SELECT id FROM dream_sessions WHERE anima_id=?1)", params![anima_id])?;
            conn.execute("DELETE FROM dream_sessions WHERE anima_id=?1", params![anima_id])?;
            conn.execute("DELETE FROM memory_packs WHERE anima_id=?1", params![anima_id])?;
            conn.execute("DELETE FROM synthesis_configs WHERE anima_id=?1", params![anima_id])?;
            conn.execute("DELETE FROM io_configs WHERE anima_id=?1", params![anima_id])?;
            conn.execute("DELETE FROM identities WHERE anima_id=?1", params![anima_id])?;
            totals.knowledge += conn.execute("DELETE FROM knowledge WHERE anima_id=?1", params![anima_id])? as u64;
            totals.memories += conn.execute("DELETE FROM memories WHERE anima_id=?1", params![anima_id])? as u64;
            totals.events += conn.execute("DELETE FROM events WHERE anima_id=?1", params![anima_id])? as u64;
            totals.animas += conn.execute("DELETE FROM animas WHERE id=?1", params![anima_id])? as u64;
        }
        Ok(totals)
    }

    /// Deletes all records created after `cutoff` across the fixed table
    /// list (§6 CLI surface).
    pub fn purge_since(&self, cutoff: DateTime<Utc>, dry_run: bool) -> Result<Vec<(&'static str, u64)>> {
        const TABLES: &[&str] = &[
            "dream_actions",
            "dream_sessions",
            "memory_packs",
            "knowledge_audit_log",
            "knowledge",
            "memory_events",
            "memories",
            "events",
            "animas",
        ];
        let conn = self.conn();
        let mut results = Vec::with_capacity(TABLES.len());
        for table in TABLES {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE created_at > ?1"),
                params![cutoff],
                |r| r.get(0),
            )?;
            if !dry_run {
                conn.execute(&format!("DELETE FROM {table} WHERE created_at > ?1"), params![cutoff])?;
            }
            results.push((*table, count as u64));
        }
        Ok(results)
    }

    fn count_memories_for_anima(&self, anima_id: AnimaId) -> Result<u64> {
        let conn = self.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memories WHERE anima_id=?1", params![anima_id], |r| r.get(0))?;
        Ok(count as u64)
    }

    fn count_events_for_anima(&self, anima_id: AnimaId) -> Result<u64> {
        let conn = self.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM events WHERE anima_id=?1", params![anima_id], |r| r.get(0))?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Privileged owner resolution (§4.3) — the one place allowed to read
    // across the tenancy boundary, since the predicate it serves needs the
    // owner id before it can be applied.
    // ------------------------------------------------------------------

    /// A soft-deleted anima resolves to no owner: cascade-deletion counts as
    /// a broken owner chain, so a stale `TenantSession` can't keep mutating
    /// an anima that `get_anima(.., include_deleted=false)` already treats
    /// as gone (spec §8 invariant 6).
    pub fn resolve_anima_owner(&self, anima_id: AnimaId) -> Result<Option<UserId>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT user_id FROM animas WHERE id = ?1 AND is_deleted = 0",
            params![anima_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn resolve_memory_owner(&self, memory_id: MemoryId) -> Result<Option<UserId>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT a.user_id FROM memories m JOIN animas a ON a.id = m.anima_id
             WHERE m.id = ?1 AND m.is_deleted = 0 AND a.is_deleted = 0",
            params![memory_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn resolve_event_owner(&self, event_id: EventId) -> Result<Option<UserId>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT a.user_id FROM events e JOIN animas a ON a.id = e.anima_id
             WHERE e.id = ?1 AND e.is_deleted = 0 AND a.is_deleted = 0",
            params![event_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn resolve_knowledge_owner(&self, knowledge_id: KnowledgeId) -> Result<Option<UserId>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT a.user_id FROM knowledge k JOIN animas a ON a.id = k.anima_id
             WHERE k.id = ?1 AND k.is_deleted = 0 AND a.is_deleted = 0",
            params![knowledge_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Lists every non-deleted anima id, used by the scheduler orchestrator
    /// to fan out per-anima workflow runs.
    pub fn list_all_anima_ids(&self) -> Result<Vec<AnimaId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM animas WHERE is_deleted = 0")?;
        let rows = stmt.query_map([], |r| r.get::<_, AnimaId>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

// ----------------------------------------------------------------------
// Row mappers and small enum<->TEXT helpers
// ----------------------------------------------------------------------

fn read_embedding(row: &Row, blob_col: &str, model_col: &str) -> rusqlite::Result<Option<Embedding>> {
    let blob: Option<Vec<u8>> = row.get(blob_col)?;
    let model: Option<String> = row.get(model_col)?;
    Ok(match (blob, model) {
        (Some(bytes), Some(model)) => Some(Embedding::new(decode_embedding(&bytes), model)),
        _ => None,
    })
}

fn row_to_anima(row: &Row) -> rusqlite::Result<Anima> {
    Ok(Anima {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        organization_id: row.get("organization_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        metadata: row.get("metadata")?,
        is_dormant: row.get("is_dormant")?,
        last_activity_at: row.get("last_activity_at")?,
        last_synthesis_check_at: row.get("last_synthesis_check_at")?,
        is_deleted: row.get("is_deleted")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let type_str: String = row.get("event_type")?;
    Ok(Event {
        id: row.get("id")?,
        anima_id: row.get("anima_id")?,
        event_type: type_str.parse().unwrap(),
        role: row.get("role")?,
        author: row.get("author")?,
        content: row.get("content")?,
        summary: row.get("summary")?,
        occurred_at: row.get("occurred_at")?,
        session: row.get("session")?,
        metadata: row.get("metadata")?,
        source_uri: row.get("source_uri")?,
        dedupe_key: row.get("dedupe_key")?,
        importance: row.get("importance")?,
        is_deleted: row.get("is_deleted")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_memory_event(row: &Row) -> rusqlite::Result<MemoryEvent> {
    Ok(MemoryEvent {
        id: row.get("id")?,
        memory_id: row.get("memory_id")?,
        event_id: row.get("event_id")?,
        link_strength: row.get("link_strength")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_memory(row: &Row) -> rusqlite::Result<Memory> {
    let state_str: String = row.get("state")?;
    Ok(Memory {
        id: row.get("id")?,
        anima_id: row.get("anima_id")?,
        content: row.get("content")?,
        summary: row.get("summary")?,
        importance: row.get("importance")?,
        confidence: row.get("confidence")?,
        state: state_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        recency_score: row.get("recency_score")?,
        decay_score: row.get("decay_score")?,
        time_start: row.get("time_start")?,
        time_end: row.get("time_end")?,
        metadata: row.get("metadata")?,
        embedding: read_embedding(row, "embedding", "embedding_model")?,
        is_deleted: row.get("is_deleted")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_knowledge(row: &Row) -> rusqlite::Result<KnowledgeItem> {
    let type_str: String = row.get("knowledge_type")?;
    let source_str: String = row.get("source_type")?;
    Ok(KnowledgeItem {
        id: row.get("id")?,
        anima_id: row.get("anima_id")?,
        knowledge_type: type_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        topic: row.get("topic")?,
        content: row.get("content")?,
        summary: row.get("summary")?,
        confidence: row.get("confidence")?,
        source_type: match source_str.as_str() {
            "EXTERNAL" => KnowledgeSourceType::External,
            _ => KnowledgeSourceType::Internal,
        },
        embedding: read_embedding(row, "embedding", "embedding_model")?,
        is_deleted: row.get("is_deleted")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_knowledge_audit_log(row: &Row) -> rusqlite::Result<KnowledgeAuditLog> {
    let action_str: String = row.get("action")?;
    Ok(KnowledgeAuditLog {
        id: row.get("id")?,
        knowledge_id: row.get("knowledge_id")?,
        action: match action_str.as_str() {
            "CREATE" => KnowledgeAction::Create,
            "UPDATE" => KnowledgeAction::Update,
            "DELETE" => KnowledgeAction::Delete,
            _ => KnowledgeAction::Restore,
        },
        source_type: row.get("source_type")?,
        source_id: row.get("source_id")?,
        before: row.get("before_state")?,
        after: row.get("after_state")?,
        change_summary: row.get("change_summary")?,
        trigger: row.get("trigger")?,
        created_at: row.get("created_at")?,
    })
}

fn knowledge_source_type_str(source_type: KnowledgeSourceType) -> &'static str {
    match source_type {
        KnowledgeSourceType::Internal => "INTERNAL",
        KnowledgeSourceType::External => "EXTERNAL",
    }
}

fn knowledge_action_str(action: KnowledgeAction) -> &'static str {
    match action {
        KnowledgeAction::Create => "CREATE",
        KnowledgeAction::Update => "UPDATE",
        KnowledgeAction::Delete => "DELETE",
        KnowledgeAction::Restore => "RESTORE",
    }
}

fn row_to_synthesis_config(row: &Row) -> rusqlite::Result<SynthesisConfig> {
    Ok(SynthesisConfig {
        anima_id: row.get("anima_id")?,
        time_weight: row.get("time_weight")?,
        event_weight: row.get("event_weight")?,
        token_weight: row.get("token_weight")?,
        threshold: row.get("threshold")?,
        llm_temperature: row.get("llm_temperature")?,
        max_tokens: row.get("max_tokens")?,
        scheduler_interval_hours: row.get("scheduler_interval_hours")?,
        last_synthesis_check_at: row.get("last_synthesis_check_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_io_config(row: &Row) -> rusqlite::Result<IoConfig> {
    Ok(IoConfig {
        anima_id: row.get("anima_id")?,
        read_settings: row.get("read_settings")?,
        write_settings: row.get("write_settings")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_identity(row: &Row) -> rusqlite::Result<IdentitySelfModel> {
    Ok(IdentitySelfModel {
        anima_id: row.get("anima_id")?,
        name: row.get("name")?,
        personality_type: row.get("personality_type")?,
        communication_style: row.get("communication_style")?,
        self_reflection: row.get("self_reflection")?,
        is_deleted: row.get("is_deleted")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn dream_trigger_str(t: DreamTrigger) -> &'static str {
    match t {
        DreamTrigger::Scheduled => "SCHEDULED",
        DreamTrigger::Manual => "MANUAL",
    }
}

fn dream_status_str(s: DreamStatus) -> &'static str {
    match s {
        DreamStatus::Running => "RUNNING",
        DreamStatus::Completed => "COMPLETED",
        DreamStatus::Failed => "FAILED",
    }
}

fn dream_phase_str(p: DreamPhase) -> &'static str {
    match p {
        DreamPhase::LightSleep => "LIGHT_SLEEP",
        DreamPhase::DeepSleep => "DEEP_SLEEP",
    }
}

fn action_type_str(a: ActionType) -> &'static str {
    match a {
        ActionType::Merge => "MERGE",
        ActionType::Split => "SPLIT",
        ActionType::Update => "UPDATE",
        ActionType::Archive => "ARCHIVE",
        ActionType::Delete => "DELETE",
    }
}

fn row_to_dream_session(row: &Row) -> rusqlite::Result<DreamSession> {
    let trigger_str: String = row.get("trigger")?;
    let status_str: String = row.get("status")?;
    Ok(DreamSession {
        id: row.get("id")?,
        anima_id: row.get("anima_id")?,
        trigger: match trigger_str.as_str() {
            "MANUAL" => DreamTrigger::Manual,
            _ => DreamTrigger::Scheduled,
        },
        triggered_by_user_id: row.get("triggered_by_user_id")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        status: match status_str.as_str() {
            "COMPLETED" => DreamStatus::Completed,
            "FAILED" => DreamStatus::Failed,
            _ => DreamStatus::Running,
        },
        error_message: row.get("error_message")?,
        memories_reviewed: row.get("memories_reviewed")?,
        memories_modified: row.get("memories_modified")?,
        memories_created: row.get("memories_created")?,
        memories_archived: row.get("memories_archived")?,
        memories_deleted: row.get("memories_deleted")?,
        summary: row.get("summary")?,
        config_snapshot: row.get("config_snapshot")?,
    })
}

fn row_to_dream_action(row: &Row) -> rusqlite::Result<DreamAction> {
    let action_str: String = row.get("action_type")?;
    let phase_str: String = row.get("phase")?;
    let source_json: String = row.get("source_memory_ids")?;
    let result_json: Option<String> = row.get("result_memory_ids")?;
    Ok(DreamAction {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        action_type: match action_str.as_str() {
            "MERGE" => ActionType::Merge,
            "SPLIT" => ActionType::Split,
            "UPDATE" => ActionType::Update,
            "ARCHIVE" => ActionType::Archive,
            _ => ActionType::Delete,
        },
        phase: match phase_str.as_str() {
            "DEEP_SLEEP" => DreamPhase::DeepSleep,
            _ => DreamPhase::LightSleep,
        },
        source_memory_ids: serde_json::from_str(&source_json).unwrap_or_default(),
        result_memory_ids: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        before_state: row.get("before_state")?,
        after_state: row.get("after_state")?,
        reasoning: row.get("reasoning")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_api_key(row: &Row) -> rusqlite::Result<ApiKey> {
    let count: i64 = row.get("request_count")?;
    Ok(ApiKey {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        key_hash: row.get("key_hash")?,
        public_prefix: row.get("public_prefix")?,
        last_used_at: row.get("last_used_at")?,
        request_count: count as u64,
        is_active: row.get("is_active")?,
        expires_at: row.get("expires_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::OrganizationId;

    fn test_store() -> Store {
        Store::open_in_memory().expect("in-memory store")
    }

    fn seed_anima(store: &Store) -> Anima {
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "test-anima");
        store.create_anima(&anima).unwrap();
        anima
    }

    #[test]
    fn create_and_get_anima_roundtrips() {
        let store = test_store();
        let anima = seed_anima(&store);
        let fetched = store.get_anima(anima.id, false).unwrap().unwrap();
        assert_eq!(fetched.id, anima.id);
        assert_eq!(fetched.name, "test-anima");
    }

    #[test]
    fn soft_deleted_anima_hidden_by_default() {
        let store = test_store();
        let anima = seed_anima(&store);
        store.cascade_soft_delete_anima(anima.id, Utc::now()).unwrap();
        assert!(store.get_anima(anima.id, false).unwrap().is_none());
        assert!(store.get_anima(anima.id, true).unwrap().is_some());
    }

    #[test]
    fn cascade_delete_and_restore_round_trip() {
        let store = test_store();
        let anima = seed_anima(&store);
        let event = Event {
            id: EventId::new(),
            anima_id: anima.id,
            event_type: EventType::MessageIn,
            role: None,
            author: None,
            content: "hello".into(),
            summary: None,
            occurred_at: Utc::now(),
            session: None,
            metadata: crate::entities::empty_metadata(),
            source_uri: None,
            dedupe_key: None,
            importance: None,
            is_deleted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.create_event(&event).unwrap();

        let counts = store.cascade_soft_delete_anima(anima.id, Utc::now()).unwrap();
        assert_eq!(counts.events, 1);
        assert!(store.get_event(event.id, false).unwrap().is_none());

        store.cascade_restore_anima(anima.id, Utc::now()).unwrap();
        assert!(store.get_anima(anima.id, false).unwrap().is_some());
        assert!(store.get_event(event.id, false).unwrap().is_some());
        assert!(store.get_or_create_synthesis_config(anima.id).is_ok());
    }

    #[test]
    fn event_dedupe_key_unique_per_anima() {
        let store = test_store();
        let anima = seed_anima(&store);
        let make_event = || Event {
            id: EventId::new(),
            anima_id: anima.id,
            event_type: EventType::MessageIn,
            role: None,
            author: None,
            content: "hello".into(),
            summary: None,
            occurred_at: Utc::now(),
            session: None,
            metadata: crate::entities::empty_metadata(),
            source_uri: None,
            dedupe_key: Some("fixed-key".into()),
            importance: None,
            is_deleted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.create_event(&make_event()).unwrap();
        let result = store.create_event(&make_event());
        assert!(result.is_err());
    }

    #[test]
    fn pack_retention_bounds_count() {
        let store = test_store();
        let anima = seed_anima(&store);
        for i in 0..5 {
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
        let deleted = store.enforce_pack_retention(anima.id, 3).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count_memory_packs(anima.id).unwrap(), 3);
    }
}
