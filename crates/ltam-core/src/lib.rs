//! # LTAM Core
//!
//! Storage and workflow engine behind a multi-tenant long-term agentic
//! memory (LTAM) service. An *anima* is the logical owner of memory: raw
//! [`Event`](entities::Event)s accumulate against it, periodic or on-demand
//! *synthesis* distills them into [`Memory`](entities::Memory) rows, a
//! background *dream* cycle curates those memories over time, and a
//! *pack compiler* assembles a token-budgeted context window for a caller
//! to hand to its own LLM.
//!
//! ## Modules
//!
//! - [`entities`] — persisted row types (anima, event, memory, knowledge,
//!   dream session/action, memory pack, API key, config).
//! - [`ids`] — typed UUID newtypes, one per entity.
//! - [`error`] — the crate-wide [`error::CoreError`] taxonomy.
//! - [`store`] — the `rusqlite`-backed [`store::Store`] repository and its
//!   embedded migrations.
//! - [`tenancy`] — the application-layer ownership envelope
//!   ([`tenancy::TenantSession`]) that stands in for row-level security.
//! - [`scoring`] — pure recency/decay/combined scoring primitives.
//! - [`retrieval`] — time-window, semantic, and temporal-context memory
//!   queries built on [`scoring`].
//! - [`pack`] — the four-layer memory-pack compiler and its retention
//!   janitor.
//! - [`synthesis`] — the event-to-memory synthesis pipeline and its
//!   knowledge-extraction sub-pipeline.
//! - [`dream`] — the light-sleep/deep-sleep curation engine.
//! - [`hooks`] — fire-and-forget background triggers (today, just the
//!   auto-knowledge hook run after synthesis).
//! - [`collaborators`] — the `EmbeddingClient`/`LlmClient` contracts a
//!   composing binary implements with a real model backend.
//! - [`config`] — ambient helpers (default database path resolution) for
//!   the binaries that compose this crate.
//!
//! `ltam-scheduler` and `ltam-cli` compose this crate into a runnable
//! service and a maintenance binary, respectively; this crate itself never
//! opens a network socket or reads `argv`.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod collaborators;
pub mod config;
pub mod dream;
pub mod entities;
pub mod error;
pub mod hooks;
pub mod ids;
pub mod pack;
pub mod retrieval;
pub mod scoring;
pub mod store;
pub mod synthesis;
pub mod tenancy;

pub use error::{CoreError, Result};

/// Default embedding model tag used when a collaborator doesn't specify
/// one of its own. Persisted alongside every [`entities::Embedding`] so a
/// later model swap can be detected rather than silently compared against
/// vectors from a different space.
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Convenient imports for the common cross-module call pattern: construct
/// a [`store::Store`], wrap collaborators, and drive one of the workflow
/// entry points.
pub mod prelude {
    pub use crate::collaborators::{Collaborators, EmbeddingClient, LlmClient};
    pub use crate::entities::{
        Anima, ApiKey, DreamAction, DreamSession, Event, EventType, IdentitySelfModel, IoConfig,
        KnowledgeItem, Memory, MemoryPack, SynthesisConfig,
    };
    pub use crate::error::{CoreError, Result};
    pub use crate::ids::{
        AnimaId, ApiKeyId, DreamActionId, DreamSessionId, EventId, KnowledgeId, MemoryId,
        MemoryPackId, OrganizationId, UserId,
    };
    pub use crate::store::Store;
    pub use crate::tenancy::TenantSession;
}
