//! Versioned schema migrations, applied in order against `schema_version`.
//!
//! Follows the teacher's pattern of a flat `&[Migration]` table of SQL
//! constants rather than an external migration framework.

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial LTAM schema: animas, events, memories, knowledge, dreams, packs, configs",
    up: MIGRATION_V1_UP,
}];

const MIGRATION_V1_UP: &str = r#"
CREATE TABLE animas (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    is_dormant INTEGER NOT NULL DEFAULT 0,
    last_activity_at TEXT,
    last_synthesis_check_at TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX idx_animas_user ON animas(user_id);
CREATE INDEX idx_animas_org ON animas(organization_id);

CREATE TABLE events (
    id TEXT PRIMARY KEY,
    anima_id TEXT NOT NULL REFERENCES animas(id),
    event_type TEXT NOT NULL,
    role TEXT,
    author TEXT,
    content TEXT NOT NULL,
    summary TEXT,
    occurred_at TEXT NOT NULL,
    session TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    source_uri TEXT,
    dedupe_key TEXT,
    importance REAL,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX idx_events_anima_time ON events(anima_id, occurred_at);
CREATE INDEX idx_events_anima_type ON events(anima_id, event_type);
CREATE INDEX idx_events_session ON events(anima_id, session);
CREATE UNIQUE INDEX idx_events_dedupe ON events(anima_id, dedupe_key)
    WHERE dedupe_key IS NOT NULL;

CREATE TABLE memories (
    id TEXT PRIMARY KEY,
    anima_id TEXT NOT NULL REFERENCES animas(id),
    content TEXT NOT NULL,
    summary TEXT NOT NULL,
    importance REAL,
    confidence REAL,
    state TEXT NOT NULL DEFAULT 'active',
    recency_score REAL,
    decay_score REAL,
    time_start TEXT NOT NULL,
    time_end TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    embedding BLOB,
    embedding_model TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX idx_memories_anima_state ON memories(anima_id, state);
CREATE INDEX idx_memories_anima_time ON memories(anima_id, created_at);

CREATE TABLE memory_events (
    id TEXT PRIMARY KEY,
    memory_id TEXT NOT NULL REFERENCES memories(id),
    event_id TEXT NOT NULL REFERENCES events(id),
    link_strength REAL,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX idx_memory_events_pair ON memory_events(memory_id, event_id);
CREATE INDEX idx_memory_events_event ON memory_events(event_id);

CREATE TABLE knowledge (
    id TEXT PRIMARY KEY,
    anima_id TEXT NOT NULL REFERENCES animas(id),
    knowledge_type TEXT NOT NULL,
    topic TEXT,
    content TEXT NOT NULL,
    summary TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.5,
    source_type TEXT NOT NULL DEFAULT 'INTERNAL',
    embedding BLOB,
    embedding_model TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX idx_knowledge_anima_type ON knowledge(anima_id, knowledge_type);

CREATE TABLE knowledge_audit_log (
    id TEXT PRIMARY KEY,
    knowledge_id TEXT NOT NULL,
    action TEXT NOT NULL,
    source_type TEXT NOT NULL,
    source_id TEXT,
    before_state TEXT,
    after_state TEXT,
    change_summary TEXT,
    trigger TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_knowledge_audit_knowledge ON knowledge_audit_log(knowledge_id);

CREATE TABLE synthesis_configs (
    anima_id TEXT PRIMARY KEY REFERENCES animas(id),
    time_weight REAL NOT NULL,
    event_weight REAL NOT NULL,
    token_weight REAL NOT NULL,
    threshold REAL NOT NULL,
    llm_temperature REAL NOT NULL,
    max_tokens INTEGER NOT NULL,
    scheduler_interval_hours INTEGER NOT NULL,
    last_synthesis_check_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE io_configs (
    anima_id TEXT PRIMARY KEY REFERENCES animas(id),
    read_settings TEXT NOT NULL DEFAULT '{}',
    write_settings TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE identities (
    anima_id TEXT PRIMARY KEY REFERENCES animas(id),
    name TEXT NOT NULL,
    personality_type TEXT,
    communication_style TEXT,
    self_reflection TEXT NOT NULL DEFAULT '{}',
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE memory_packs (
    id TEXT PRIMARY KEY,
    anima_id TEXT NOT NULL REFERENCES animas(id),
    query TEXT,
    preset TEXT,
    session_count INTEGER NOT NULL,
    knowledge_count INTEGER NOT NULL,
    long_term_count INTEGER NOT NULL,
    token_count INTEGER NOT NULL,
    max_tokens INTEGER NOT NULL,
    content TEXT NOT NULL,
    compiled_at TEXT NOT NULL
);
CREATE INDEX idx_packs_anima_compiled ON memory_packs(anima_id, compiled_at);

CREATE TABLE dream_sessions (
    id TEXT PRIMARY KEY,
    anima_id TEXT NOT NULL REFERENCES animas(id),
    trigger TEXT NOT NULL,
    triggered_by_user_id TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    error_message TEXT,
    memories_reviewed INTEGER NOT NULL DEFAULT 0,
    memories_modified INTEGER NOT NULL DEFAULT 0,
    memories_created INTEGER NOT NULL DEFAULT 0,
    memories_archived INTEGER NOT NULL DEFAULT 0,
    memories_deleted INTEGER NOT NULL DEFAULT 0,
    summary TEXT,
    config_snapshot TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX idx_dream_sessions_anima_status ON dream_sessions(anima_id, status);

CREATE TABLE dream_actions (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES dream_sessions(id),
    action_type TEXT NOT NULL,
    phase TEXT NOT NULL,
    source_memory_ids TEXT NOT NULL,
    result_memory_ids TEXT,
    before_state TEXT NOT NULL,
    after_state TEXT,
    reasoning TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_dream_actions_session ON dream_actions(session_id);

CREATE TABLE api_keys (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    key_hash TEXT NOT NULL,
    public_prefix TEXT NOT NULL,
    last_used_at TEXT,
    request_count INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX idx_api_keys_prefix ON api_keys(public_prefix);
CREATE INDEX idx_api_keys_user ON api_keys(user_id);
"#;
