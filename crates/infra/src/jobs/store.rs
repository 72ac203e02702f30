//! Job storage.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use outreach_core::ResourceKey;

use super::types::{Job, JobId, JobKind, JobProgress, JobStatus};
use crate::snapshot::{SnapshotError, SnapshotFile, SnapshotTable};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn create(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Persist `job` unless an active job already exists for its `(resource, kind)`.
    fn create_exclusive(&self, job: Job) -> Result<CreateOutcome, JobStoreError>;

    /// Copy of the job, if known.
    fn get(&self, id: JobId) -> Option<Job>;

    /// Copies of every job for `resource`, newest first.
    fn get_by_resource(&self, resource: &ResourceKey) -> Vec<Job>;

    fn mark_running(&self, id: JobId) -> Result<(), JobStoreError>;

    /// In-memory only; progress is written out with the next durable mutation.
    fn update_progress(&self, id: JobId, progress: &JobProgress) -> Result<(), JobStoreError>;

    /// Authoritative terminal write.
    fn finalize(
        &self,
        id: JobId,
        status: JobStatus,
        progress: JobProgress,
        error: Option<String>,
    ) -> Result<Job, JobStoreError>;

    /// Keep the `keep` most recently started jobs per resource. Returns how many were dropped.
    fn cleanup(&self, keep: usize) -> Result<usize, JobStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Job),
    Existing(Job),
}

/// Job store error.
#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} already finished")]
    AlreadyFinished(JobId),
    #[error("storage error: {0}")]
    Storage(#[from] SnapshotError),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Snapshot-backed job store; one instance (and one file) per job kind.
#[derive(Debug)]
pub struct SnapshotJobStore {
    table: SnapshotTable<Job>,
}

impl SnapshotJobStore {
    /// Store without a backing file, for non-durable kinds and tests.
    pub fn in_memory() -> Self {
        Self {
            table: SnapshotTable::in_memory(),
        }
    }

    /// Load `jobs-<kind>.json` from `data_dir`, failing every job a previous process left active.
    pub fn open(data_dir: &Path, kind: JobKind) -> Result<Self, JobStoreError> {
        let file = SnapshotFile::new(data_dir.join(format!("jobs-{kind}.json")));
        let table: SnapshotTable<Job> = SnapshotTable::open(file)?;

        let reconciled = table.update_in_memory(|jobs| {
            jobs.iter_mut()
                .map(Job::reconcile_interrupted)
                .filter(|changed| *changed)
                .count()
        });
        if reconciled > 0 {
            table.persist()?;
            info!(kind = %kind, reconciled, "failed jobs interrupted by restart");
        }

        Ok(Self { table })
    }

    fn insert(jobs: &mut Vec<Job>, job: Job) -> Job {
        jobs.push(job.clone());
        job
    }

    fn with_job<R>(
        jobs: &mut [Job],
        id: JobId,
        f: impl FnOnce(&mut Job) -> Result<R, JobStoreError>,
    ) -> Result<R, JobStoreError> {
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(JobStoreError::NotFound(id))?;
        f(job)
    }
}

impl JobStore for SnapshotJobStore {
    fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        Ok(self.table.update(|jobs| Self::insert(jobs, job))?)
    }

    fn create_exclusive(&self, job: Job) -> Result<CreateOutcome, JobStoreError> {
        // Check and insert under one write lock so two callers cannot both create.
        Ok(self.table.update(|jobs| {
            let active = jobs.iter().find(|j| {
                j.resource == job.resource && j.kind == job.kind && j.status.is_active()
            });
            match active {
                Some(existing) => CreateOutcome::Existing(existing.clone()),
                None => CreateOutcome::Created(Self::insert(jobs, job)),
            }
        })?)
    }

    fn get(&self, id: JobId) -> Option<Job> {
        self.table.find(&id)
    }

    fn get_by_resource(&self, resource: &ResourceKey) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.table.read(|jobs| {
            jobs.iter()
                .filter(|j| &j.resource == resource)
                .cloned()
                .collect()
        });
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        jobs
    }

    fn mark_running(&self, id: JobId) -> Result<(), JobStoreError> {
        self.table.update(|jobs| {
            Self::with_job(jobs, id, |job| {
                if job.status.is_terminal() {
                    return Err(JobStoreError::AlreadyFinished(id));
                }
                job.mark_running();
                Ok(())
            })
        })?
    }

    fn update_progress(&self, id: JobId, progress: &JobProgress) -> Result<(), JobStoreError> {
        self.table.update_in_memory(|jobs| {
            Self::with_job(jobs, id, |job| {
                if job.status.is_terminal() {
                    return Err(JobStoreError::AlreadyFinished(id));
                }
                job.progress = progress.clone();
                job.updated_at = Utc::now();
                Ok(())
            })
        })
    }

    fn finalize(
        &self,
        id: JobId,
        status: JobStatus,
        progress: JobProgress,
        error: Option<String>,
    ) -> Result<Job, JobStoreError> {
        let job = self.table.update_in_memory(|jobs| {
            Self::with_job(jobs, id, |job| {
                if job.status.is_terminal() {
                    return Err(JobStoreError::AlreadyFinished(id));
                }
                job.finish(status, progress, error);
                Ok(job.clone())
            })
        })?;
        // The terminal state stays visible in memory even if this write fails.
        self.table.persist()?;
        Ok(job)
    }

    fn cleanup(&self, keep: usize) -> Result<usize, JobStoreError> {
        Ok(self.table.update(|jobs| {
            let mut by_resource: HashMap<ResourceKey, Vec<(chrono::DateTime<Utc>, JobId)>> =
                HashMap::new();
            for job in jobs.iter() {
                by_resource
                    .entry(job.resource.clone())
                    .or_default()
                    .push((job.started_at, job.id));
            }

            let mut doomed = Vec::new();
            for (_, mut started) in by_resource {
                if started.len() <= keep {
                    continue;
                }
                started.sort_by(|a, b| b.cmp(a));
                doomed.extend(started.into_iter().skip(keep).map(|(_, id)| id));
            }

            let before = jobs.len();
            // Active jobs are never dropped, whatever their age.
            jobs.retain(|j| j.status.is_active() || !doomed.contains(&j.id));
            before - jobs.len()
        })?)
    }
}

/// Logs (instead of propagating) a failed cleanup; used from background tasks.
pub(crate) fn cleanup_in_background(store: &dyn JobStore, keep: usize, kind: JobKind) {
    match store.cleanup(keep) {
        Ok(0) => {}
        Ok(removed) => info!(kind = %kind, removed, "pruned old jobs"),
        Err(e) => warn!(kind = %kind, error = %e, "job cleanup failed"),
    }
}
