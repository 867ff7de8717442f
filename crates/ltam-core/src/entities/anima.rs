use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AnimaId, OrganizationId, UserId};

use super::Metadata;

/// Logical owner of memory. Every other entity derives its owning user
/// through its anima.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anima {
    pub id: AnimaId,
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub description: Option<String>,
    pub metadata: Metadata,
    pub is_dormant: bool,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// High-water mark for the synthesis threshold gate (§4.6): advanced to
    /// `now` whenever a check finds no new events, so an inactive anima
    /// never accumulates unbounded idle time.
    pub last_synthesis_check_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Anima {
    pub fn new(user_id: UserId, organization_id: OrganizationId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AnimaId::new(),
            user_id,
            organization_id,
            name: name.into(),
            description: None,
            metadata: super::empty_metadata(),
            is_dormant: false,
            last_activity_at: None,
            last_synthesis_check_at: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}
