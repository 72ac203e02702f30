//! Linked account materialized by a successful handshake.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::{Entity, OwnerKey, ResourceKey};
use outreach_protocol::AccountIdentity;

/// A remote account the engine may run jobs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Equal to the remote user id.
    pub id: ResourceKey,
    pub owner: OwnerKey,
    pub remote_id: i64,
    pub phone: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn from_identity(owner: OwnerKey, identity: AccountIdentity, now: DateTime<Utc>) -> Self {
        Self {
            id: ResourceKey::from(identity.remote_id),
            owner,
            remote_id: identity.remote_id,
            phone: identity.phone,
            first_name: identity.first_name,
            last_name: identity.last_name,
            username: identity.username,
            photo_url: identity.photo_url,
            is_active: true,
            created_at: now,
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

impl Entity for Account {
    type Id = ResourceKey;

    fn id(&self) -> &ResourceKey {
        &self.id
    }
}
