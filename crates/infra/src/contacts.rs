//! Directory of verified remote users, per account.
//!
//! Verify and import jobs write here; send jobs resolve their targets from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::{ContactId, Entity, ResourceKey};
use outreach_protocol::RemoteUser;

use crate::snapshot::{SnapshotError, SnapshotFile, SnapshotTable};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub resource: ResourceKey,
    pub remote_id: i64,
    pub access_hash: i64,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    fn from_remote(resource: &ResourceKey, user: &RemoteUser, labels: &[String], now: DateTime<Utc>) -> Self {
        Self {
            id: ContactId::new(),
            resource: resource.clone(),
            remote_id: user.remote_id,
            access_hash: user.access_hash,
            phone: user.phone.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            alias: user.alias.clone(),
            labels: dedup_labels(labels.iter().cloned()),
            is_valid: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a fresh sighting of the same user into this record.
    fn merge(&mut self, user: &RemoteUser, labels: &[String], now: DateTime<Utc>) {
        self.access_hash = user.access_hash;
        if user.phone.is_some() {
            self.phone = user.phone.clone();
        }
        if !user.first_name.is_empty() {
            self.first_name = user.first_name.clone();
        }
        if !user.last_name.is_empty() {
            self.last_name = user.last_name.clone();
        }
        if user.alias.is_some() {
            self.alias = user.alias.clone();
        }
        let current = std::mem::take(&mut self.labels);
        self.labels = dedup_labels(current.into_iter().chain(labels.iter().cloned()));
        self.is_valid = true;
        self.updated_at = now;
    }

    pub fn to_remote_user(&self) -> RemoteUser {
        RemoteUser {
            remote_id: self.remote_id,
            access_hash: self.access_hash,
            phone: self.phone.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            alias: self.alias.clone(),
        }
    }
}

impl Entity for Contact {
    type Id = ContactId;

    fn id(&self) -> &ContactId {
        &self.id
    }
}

fn dedup_labels(labels: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        let label = label.trim();
        if !label.is_empty() && !out.iter().any(|l| l == label) {
            out.push(label.to_string());
        }
    }
    out
}

#[derive(Debug)]
pub struct ContactStore {
    table: SnapshotTable<Contact>,
}

impl ContactStore {
    pub fn in_memory() -> Self {
        Self {
            table: SnapshotTable::in_memory(),
        }
    }

    pub fn open(file: SnapshotFile) -> Result<Self, SnapshotError> {
        Ok(Self {
            table: SnapshotTable::open(file)?,
        })
    }

    /// Insert or merge by `(resource, remote_id)`; returns the stored records in input order.
    pub fn upsert_many(
        &self,
        resource: &ResourceKey,
        users: &[RemoteUser],
        labels: &[String],
    ) -> Result<Vec<Contact>, SnapshotError> {
        if users.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        self.table.update(|rows| {
            users
                .iter()
                .map(|user| {
                    let existing = rows
                        .iter_mut()
                        .find(|c| &c.resource == resource && c.remote_id == user.remote_id);
                    match existing {
                        Some(contact) => {
                            contact.merge(user, labels, now);
                            contact.clone()
                        }
                        None => {
                            let contact = Contact::from_remote(resource, user, labels, now);
                            rows.push(contact.clone());
                            contact
                        }
                    }
                })
                .collect()
        })
    }

    /// Contact `id` if it belongs to `resource`.
    pub fn get(&self, resource: &ResourceKey, id: ContactId) -> Option<Contact> {
        self.table.find(&id).filter(|c| &c.resource == resource)
    }

    pub fn contains_remote(&self, resource: &ResourceKey, remote_id: i64) -> bool {
        self.table.read(|rows| {
            rows.iter()
                .any(|c| &c.resource == resource && c.remote_id == remote_id)
        })
    }

    #[cfg(test)]
    pub fn list(&self, resource: &ResourceKey) -> Vec<Contact> {
        self.table.read(|rows| {
            rows.iter()
                .filter(|c| &c.resource == resource)
                .cloned()
                .collect()
        })
    }
}
