//! Linked accounts and their exported protocol sessions.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use outreach_auth::Account;
use outreach_core::ResourceKey;
use outreach_protocol::SessionBlob;

use crate::snapshot::{self, SnapshotError, SnapshotFile, SnapshotTable};

#[derive(Debug)]
pub struct AccountStore {
    table: SnapshotTable<Account>,
}

impl AccountStore {
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

    /// Insert or replace by id. A re-linked account keeps its original `created_at`.
    pub fn upsert(&self, mut account: Account) -> Result<Account, SnapshotError> {
        self.table.update(|rows| {
            match rows.iter_mut().find(|a| a.id == account.id) {
                Some(existing) => {
                    account.created_at = existing.created_at;
                    *existing = account.clone();
                }
                None => rows.push(account.clone()),
            }
            account
        })
    }

    pub fn get(&self, id: &ResourceKey) -> Option<Account> {
        self.table.find(id)
    }

    #[cfg(test)]
    pub fn list_by_owner(&self, owner: &outreach_core::OwnerKey) -> Vec<Account> {
        self.table.read(|rows| {
            rows.iter()
                .filter(|a| &a.owner == owner)
                .cloned()
                .collect()
        })
    }
}

/// Location of one account's stored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionRef(PathBuf);

impl SessionRef {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("session not found - please re-authenticate this account")]
    Missing,
    #[error("failed to read session {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Write(#[from] SnapshotError),
}

/// One file per account under `<data_dir>/sessions/`.
#[derive(Debug, Clone)]
pub struct SessionVault {
    dir: PathBuf,
}

impl SessionVault {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn reference_for(&self, resource: &ResourceKey) -> SessionRef {
        SessionRef(self.dir.join(format!("account_{resource}.session")))
    }

    pub fn store(&self, resource: &ResourceKey, blob: &SessionBlob) -> Result<SessionRef, VaultError> {
        let reference = self.reference_for(resource);
        snapshot::write_atomic(reference.path(), &blob.0)?;
        Ok(reference)
    }

    pub fn load(&self, reference: &SessionRef) -> Result<SessionBlob, VaultError> {
        match fs::read(reference.path()) {
            Ok(bytes) if bytes.is_empty() => Err(VaultError::Missing),
            Ok(bytes) => Ok(SessionBlob(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(VaultError::Missing),
            Err(source) => Err(VaultError::Read {
                path: reference.path().to_path_buf(),
                source,
            }),
        }
    }

    #[cfg(test)]
    pub fn exists(&self, resource: &ResourceKey) -> bool {
        self.reference_for(resource).path().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::OwnerKey;
    use chrono::{Duration, Utc};
    use outreach_protocol::AccountIdentity;

    fn account(remote_id: i64, owner: &str) -> Account {
        Account::from_identity(
            OwnerKey::parse(owner).unwrap(),
            AccountIdentity {
                remote_id,
                phone: "+100".into(),
                first_name: "Kai".into(),
                last_name: String::new(),
                username: None,
                photo_url: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn relinking_keeps_created_at() {
        let store = AccountStore::in_memory();
        let mut first = account(5, "ops");
        first.created_at = Utc::now() - Duration::days(3);
        store.upsert(first.clone()).unwrap();

        let mut again = account(5, "ops");
        again.first_name = "Kai R.".into();
        let saved = store.upsert(again).unwrap();

        assert_eq!(saved.created_at, first.created_at);
        assert_eq!(store.get(&first.id).unwrap().first_name, "Kai R.");
        assert_eq!(store.list_by_owner(&OwnerKey::parse("ops").unwrap()).len(), 1);
    }

    #[test]
    fn vault_round_trips_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SessionVault::new(dir.path().join("sessions"));
        let acct = ResourceKey::parse("42").unwrap();

        let reference = vault.reference_for(&acct);
        assert!(matches!(vault.load(&reference), Err(VaultError::Missing)));
        assert!(!vault.exists(&acct));

        vault.store(&acct, &SessionBlob(b"auth-key".to_vec())).unwrap();
        assert_eq!(vault.load(&reference).unwrap(), SessionBlob(b"auth-key".to_vec()));
        assert!(reference.path().ends_with("account_42.session"));
        assert!(vault.exists(&acct));
    }
}
