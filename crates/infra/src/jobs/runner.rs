//! What a job runner sees while it executes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use outreach_core::ResourceKey;
use outreach_protocol::{ProtocolConnector, ProtocolError, ProtocolResult, ProtocolSession};

use super::store::JobStore;
use super::types::{Job, JobId, JobKind, JobParams, JobProgress, TargetOutcome};
use crate::accounts::{SessionVault, VaultError};
use crate::contacts::ContactStore;
use crate::retry::RetryPolicy;
use crate::snapshot::SnapshotError;

/// Executes one job kind.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Work through the job's targets, recording an outcome for each.
    ///
    /// Returning `Err` aborts the job; outcomes recorded so far are kept.
    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobAbort>;
}

/// Reasons a job stops before its target list is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum JobAbort {
    #[error("session not found - please re-authenticate this account")]
    SessionMissing,
    #[error("failed to load session: {0}")]
    SessionUnreadable(String),
    #[error(transparent)]
    Protocol(ProtocolError),
    #[error("job cancelled")]
    Cancelled,
    #[error("payload does not match job kind {0}")]
    PayloadMismatch(JobKind),
    #[error("failed to store contacts: {0}")]
    Storage(#[from] SnapshotError),
}

impl From<ProtocolError> for JobAbort {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Cancelled => JobAbort::Cancelled,
            other => JobAbort::Protocol(other),
        }
    }
}

/// Classify a per-target protocol error: stop the job, or record and move on.
pub(crate) fn per_target(err: ProtocolError) -> Result<ProtocolError, JobAbort> {
    if err.is_connection_fatal() || err == ProtocolError::Cancelled {
        return Err(err.into());
    }
    Ok(err)
}

/// `labels` when given, otherwise the kind's default label.
pub(crate) fn labels_or(labels: &[String], default: &str) -> Vec<String> {
    if labels.iter().any(|l| !l.trim().is_empty()) {
        labels.to_vec()
    } else {
        vec![default.to_string()]
    }
}

/// Shared services handed to every job task.
#[derive(Clone)]
pub(crate) struct JobServices {
    pub connector: Arc<dyn ProtocolConnector>,
    pub vault: Arc<SessionVault>,
    pub contacts: Arc<ContactStore>,
    pub retry: RetryPolicy,
    pub batch_size: usize,
}

pub struct JobContext {
    job: Job,
    store: Arc<dyn JobStore>,
    services: JobServices,
    cancel: CancellationToken,
    progress: JobProgress,
    connection: Option<Arc<dyn ProtocolSession>>,
}

impl JobContext {
    pub(crate) fn new(
        job: Job,
        store: Arc<dyn JobStore>,
        services: JobServices,
        cancel: CancellationToken,
    ) -> Self {
        let progress = JobProgress::with_total(job.progress.total);
        Self {
            job,
            store,
            services,
            cancel,
            progress,
            connection: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn resource(&self) -> &ResourceKey {
        &self.job.resource
    }

    pub fn params(&self) -> &JobParams {
        &self.job.payload.params
    }

    pub fn contacts(&self) -> &ContactStore {
        &self.services.contacts
    }

    pub fn batch_size(&self) -> usize {
        self.services.batch_size.max(1)
    }

    pub fn progress(&self) -> &JobProgress {
        &self.progress
    }

    pub(crate) fn into_progress(self) -> JobProgress {
        self.progress
    }

    /// The account's connection, opened on first use.
    pub async fn connection(&mut self) -> Result<Arc<dyn ProtocolSession>, JobAbort> {
        if let Some(conn) = &self.connection {
            return Ok(conn.clone());
        }

        let blob = self
            .services
            .vault
            .load(&self.job.payload.session)
            .map_err(|e| match e {
                VaultError::Missing => JobAbort::SessionMissing,
                other => JobAbort::SessionUnreadable(other.to_string()),
            })?;

        let connector = &self.services.connector;
        let transport = &self.job.payload.transport;
        let conn = self
            .services
            .retry
            .call(&self.cancel, "open_connection", || {
                connector.open_connection(&blob, transport)
            })
            .await?;

        info!(job_id = %self.job.id, resource = %self.job.resource, "connection opened");
        self.connection = Some(conn.clone());
        Ok(conn)
    }

    /// Run a protocol call under the rate-limit policy and this job's cancellation.
    pub async fn call<T, F, Fut>(&self, op_name: &str, op: F) -> ProtocolResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProtocolResult<T>>,
    {
        self.services.retry.call(&self.cancel, op_name, op).await
    }

    pub fn record(&mut self, outcome: TargetOutcome) {
        self.progress.push(outcome);
        self.report();
    }

    /// Record several outcomes and report once.
    pub fn record_all(&mut self, outcomes: impl IntoIterator<Item = TargetOutcome>) {
        for outcome in outcomes {
            self.progress.push(outcome);
        }
        self.report();
    }

    /// Raise the total as new targets are discovered.
    pub fn discover(&mut self, more: usize) {
        if more == 0 {
            return;
        }
        self.progress.total += more;
        self.report();
    }

    /// Sleep unless the job is cancelled first.
    pub async fn pause(&self, duration: Duration) -> Result<(), JobAbort> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(JobAbort::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn report(&self) {
        if let Err(e) = self.store.update_progress(self.job.id, &self.progress) {
            warn!(job_id = %self.job.id, error = %e, "progress update rejected");
        }
    }
}
