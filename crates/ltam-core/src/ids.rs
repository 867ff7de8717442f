//! Typed identifiers.
//!
//! Every entity in [`crate::entities`] is keyed by a newtype wrapping a
//! [`Uuid`] so that, say, a [`MemoryId`] can never be passed where an
//! [`EventId`] is expected. The original data model uses bare UUID columns
//! for every table; the type distinction is a Rust-native strengthening of
//! that model, not a change in what is persisted (each newtype round-trips
//! to the same `TEXT`/`BLOB` UUID representation on disk).

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0.to_string()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value.as_str().and_then(|s| {
                    Uuid::parse_str(s)
                        .map($name)
                        .map_err(|e| FromSqlError::Other(Box::new(e)))
                })
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }
    };
}

typed_id!(UserId);
typed_id!(OrganizationId);
typed_id!(AnimaId);
typed_id!(EventId);
typed_id!(MemoryId);
typed_id!(MemoryEventId);
typed_id!(KnowledgeId);
typed_id!(KnowledgeAuditLogId);
typed_id!(MemoryPackId);
typed_id!(DreamSessionId);
typed_id!(DreamActionId);
typed_id!(ApiKeyId);
