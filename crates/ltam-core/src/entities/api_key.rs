use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ApiKeyId, UserId};

/// A per-user credential. The full key is bcrypt-hashed and only ever
/// returned in plaintext at creation time (see
/// [`crate::store::Store::create_api_key`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub user_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub key_hash: String,
    pub public_prefix: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The one-time plaintext key material, returned only from creation.
pub struct NewApiKey {
    pub record: ApiKey,
    pub plaintext: String,
}

pub const API_KEY_PREFIX: &str = "sk_live_";
pub const PUBLIC_PREFIX_LEN: usize = 12;
