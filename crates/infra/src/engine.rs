//! The assembled engine: stores, job manager and handshake manager over one data dir.

use std::sync::Arc;

use tracing::info;

use outreach_protocol::ProtocolConnector;

use crate::accounts::{AccountStore, SessionVault};
use crate::config::EngineConfig;
use crate::contacts::ContactStore;
use crate::handshake::HandshakeManager;
use crate::jobs::{JobManager, JobStoreError};
use crate::snapshot::{SnapshotError, SnapshotFile};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

pub struct Engine {
    pub config: EngineConfig,
    pub accounts: Arc<AccountStore>,
    pub contacts: Arc<ContactStore>,
    pub vault: Arc<SessionVault>,
    pub jobs: JobManager,
    pub handshakes: HandshakeManager,
}

impl Engine {
    /// Load every snapshot under `config.data_dir`, reconciling jobs a previous run left active.
    pub fn open(
        config: EngineConfig,
        connector: Arc<dyn ProtocolConnector>,
    ) -> Result<Self, EngineError> {
        let dir = &config.data_dir;
        let accounts = Arc::new(AccountStore::open(SnapshotFile::new(dir.join("accounts.json")))?);
        let contacts = Arc::new(ContactStore::open(SnapshotFile::new(dir.join("contacts.json")))?);
        let vault = Arc::new(SessionVault::new(dir.join("sessions")));

        let jobs = JobManager::open(&config, connector.clone(), vault.clone(), contacts.clone())?;
        let handshakes = HandshakeManager::new(
            config.handshake.clone(),
            config.jobs.retry,
            connector,
            accounts.clone(),
            vault.clone(),
        );

        info!(data_dir = %dir.display(), "engine opened");
        Ok(Self {
            config,
            accounts,
            contacts,
            vault,
            jobs,
            handshakes,
        })
    }

    /// Cancel handshakes and running jobs; returns once every job has finalized.
    pub async fn shutdown(&self) {
        self.handshakes.shutdown();
        self.jobs.shutdown().await;
    }
}
