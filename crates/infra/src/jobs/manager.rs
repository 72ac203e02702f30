//! Starting, tracking and retrying background jobs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};

use outreach_core::{DomainError, ResourceKey};
use outreach_protocol::ProtocolConnector;

use super::import::ImportRunner;
use super::runner::{JobContext, JobRunner, JobServices};
use super::send::SendRunner;
use super::store::{cleanup_in_background, CreateOutcome, JobStore, JobStoreError, SnapshotJobStore};
use super::types::{Job, JobId, JobKind, JobPayload, JobProgress, JobStatus};
use super::verify::VerifyRunner;
use crate::accounts::SessionVault;
use crate::config::{EngineConfig, JobsConfig, KindPolicy};
use crate::contacts::ContactStore;
use crate::leases::ConnectionLeases;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("nothing to retry")]
    NothingToRetry,
    #[error("{0} jobs cannot be retried")]
    RetryUnsupported(JobKind),
    #[error("job {0} is still active")]
    StillActive(JobId),
    #[error("no runner registered for {0}")]
    NoRunner(JobKind),
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Owns the per-kind stores and the background task of every job.
pub struct JobManager {
    stores: HashMap<JobKind, Arc<dyn JobStore>>,
    runners: HashMap<JobKind, Arc<dyn JobRunner>>,
    services: JobServices,
    leases: Arc<ConnectionLeases>,
    config: JobsConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl JobManager {
    /// Open one store per kind under `config.data_dir` and register the built-in runners.
    pub fn open(
        config: &EngineConfig,
        connector: Arc<dyn ProtocolConnector>,
        vault: Arc<SessionVault>,
        contacts: Arc<ContactStore>,
    ) -> Result<Self, JobStoreError> {
        let mut stores: HashMap<JobKind, Arc<dyn JobStore>> = HashMap::new();
        for kind in JobKind::ALL {
            let store: Arc<dyn JobStore> = if config.jobs.policy(kind).durable {
                Arc::new(SnapshotJobStore::open(&config.data_dir, kind)?)
            } else {
                Arc::new(SnapshotJobStore::in_memory())
            };
            stores.insert(kind, store);
        }

        let mut manager = Self {
            stores,
            runners: HashMap::new(),
            services: JobServices {
                connector,
                vault,
                contacts,
                retry: config.jobs.retry,
                batch_size: config.jobs.batch_size,
            },
            leases: Arc::new(ConnectionLeases::new()),
            config: config.jobs.clone(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        manager.register_runner(JobKind::VerifyContacts, VerifyRunner);
        manager.register_runner(JobKind::ImportContacts, ImportRunner::contacts());
        manager.register_runner(JobKind::ImportConversations, ImportRunner::conversations());
        manager.register_runner(JobKind::SendMessages, SendRunner);
        Ok(manager)
    }

    /// Register (or replace) the runner for a job kind.
    pub fn register_runner<R>(&mut self, kind: JobKind, runner: R)
    where
        R: JobRunner + 'static,
    {
        self.runners.insert(kind, Arc::new(runner));
    }

    fn store(&self, kind: JobKind) -> Result<&Arc<dyn JobStore>, JobError> {
        // Every kind gets a store in `open`.
        self.stores
            .get(&kind)
            .ok_or(JobError::NoRunner(kind))
    }

    /// Validate, persist and spawn a job.
    ///
    /// Returns `(job, false)` when the kind allows one active job per account
    /// and one is already Pending or Running.
    pub async fn start_job(
        &self,
        resource: ResourceKey,
        kind: JobKind,
        payload: JobPayload,
    ) -> Result<(Job, bool), JobError> {
        if payload.params.kind() != kind {
            return Err(DomainError::validation(format!(
                "parameters for {} submitted as {kind}",
                payload.params.kind()
            ))
            .into());
        }
        payload.params.validate()?;
        payload.transport.validate()?;

        let runner = self
            .runners
            .get(&kind)
            .cloned()
            .ok_or(JobError::NoRunner(kind))?;
        let store = self.store(kind)?.clone();
        let policy = self.config.policy(kind);

        let job = Job::new(resource, kind, payload);
        let job = if policy.single_active {
            match blocking_write(&store, move |s| s.create_exclusive(job)).await? {
                CreateOutcome::Created(job) => job,
                CreateOutcome::Existing(existing) => {
                    info!(job_id = %existing.id, kind = %kind, resource = %existing.resource, "active job already exists");
                    return Ok((existing, false));
                }
            }
        } else {
            blocking_write(&store, move |s| s.create(job)).await?
        };

        info!(job_id = %job.id, kind = %kind, resource = %job.resource, total = job.progress.total, "job created");

        let keep = self.config.keep_per_resource;
        let cleanup_store = store.clone();
        tokio::task::spawn_blocking(move || {
            cleanup_in_background(cleanup_store.as_ref(), keep, kind)
        });

        let span = info_span!("job", job_id = %job.id, kind = %kind, resource = %job.resource);
        let task = JobTask {
            job: job.clone(),
            store,
            runner,
            services: self.services.clone(),
            leases: self.leases.clone(),
            policy,
            cancel: self.shutdown.child_token(),
        };
        self.tasks.spawn(task.drive().instrument(span));

        Ok((job, true))
    }

    /// Start a new job over the targets that failed in a finished one.
    pub async fn retry_failed(&self, id: JobId) -> Result<(Job, bool), JobError> {
        let job = self.get_job(id).ok_or(JobError::NotFound(id))?;
        if job.status.is_active() {
            return Err(JobError::StillActive(id));
        }
        if !job.kind.supports_retry() {
            return Err(JobError::RetryUnsupported(job.kind));
        }
        let failed = job.failed_targets();
        if failed.is_empty() {
            return Err(JobError::NothingToRetry);
        }

        let payload = JobPayload {
            session: job.payload.session.clone(),
            transport: job.payload.transport.clone(),
            params: job.payload.params.retain_targets(&failed)?,
        };
        info!(job_id = %id, kind = %job.kind, retrying = failed.len(), "retrying failed targets");
        self.start_job(job.resource, job.kind, payload).await
    }

    pub fn get_job(&self, id: JobId) -> Option<Job> {
        JobKind::ALL
            .iter()
            .filter_map(|kind| self.stores.get(kind))
            .find_map(|store| store.get(id))
    }

    /// Every job for `resource` across kinds, newest first.
    pub fn get_jobs_by_resource(&self, resource: &ResourceKey) -> Vec<Job> {
        let mut jobs: Vec<Job> = JobKind::ALL
            .iter()
            .filter_map(|kind| self.stores.get(kind))
            .flat_map(|store| store.get_by_resource(resource))
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        jobs
    }

    /// Cancel every job and wait until each has finalized.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("job manager stopped");
    }
}

/// Everything one spawned job needs.
struct JobTask {
    job: Job,
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    services: JobServices,
    leases: Arc<ConnectionLeases>,
    policy: KindPolicy,
    cancel: CancellationToken,
}

impl JobTask {
    async fn drive(self) {
        let JobTask {
            job,
            store,
            runner,
            services,
            leases,
            policy,
            cancel,
        } = self;
        let id = job.id;
        let deadline = Instant::now() + policy.timeout;
        let timed_out = format!("job timed out after {}s", policy.timeout.as_secs());

        // Nothing left after trimming and dedup: no lease, no connection.
        if job.payload.params.has_target_list() && job.payload.params.targets().is_empty() {
            info!("job has no targets");
            finish(&store, id, Ok(()), JobProgress::with_total(0)).await;
            return;
        }

        // Waiting for the lease counts against the deadline; the job stays Pending meanwhile.
        let _lease = if services.connector.supports_concurrent_use() {
            None
        } else {
            tokio::select! {
                lease = leases.acquire(&job.resource) => Some(lease),
                _ = sleep_until(deadline) => {
                    let progress = JobProgress::with_total(job.progress.total);
                    finish(&store, id, Err(timed_out), progress).await;
                    return;
                }
                _ = cancel.cancelled() => {
                    let progress = JobProgress::with_total(job.progress.total);
                    finish(&store, id, Err("job cancelled".to_string()), progress).await;
                    return;
                }
            }
        };

        if let Err(e) = blocking_write(&store, move |s| s.mark_running(id)).await {
            error!(error = %e, "could not mark job running");
            let progress = JobProgress::with_total(job.progress.total);
            finish(&store, id, Err(e.to_string()), progress).await;
            return;
        }
        info!("job running");

        let mut ctx = JobContext::new(job, store.clone(), services, cancel.clone());
        let result = tokio::select! {
            r = runner.run(&mut ctx) => r.map_err(|e| e.to_string()),
            _ = sleep_until(deadline) => Err(timed_out),
            _ = cancel.cancelled() => Err("job cancelled".to_string()),
        };
        finish(&store, id, result, ctx.into_progress()).await;
    }
}

/// Run a persisting store call on the blocking pool; snapshot writes fsync.
async fn blocking_write<T, F>(store: &Arc<dyn JobStore>, write: F) -> Result<T, JobStoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn JobStore) -> Result<T, JobStoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || write(store.as_ref())).await?
}

/// The single terminal write for a job.
async fn finish(
    store: &Arc<dyn JobStore>,
    id: JobId,
    result: Result<(), String>,
    progress: JobProgress,
) {
    let (status, error) = match result {
        Ok(()) => (JobStatus::Completed, None),
        Err(msg) => (JobStatus::Failed, Some(msg)),
    };
    let counters = progress.counters;
    let message = error.clone();
    let written = blocking_write(store, move |s| s.finalize(id, status, progress, message)).await;
    match written {
        Ok(_) => match &error {
            None => info!(
                succeeded = counters.succeeded,
                failed = counters.failed,
                skipped = counters.skipped,
                "job completed"
            ),
            Some(msg) => warn!(
                succeeded = counters.succeeded,
                failed = counters.failed,
                skipped = counters.skipped,
                error = %msg,
                "job failed"
            ),
        },
        Err(e) => error!(error = %e, "failed to finalize job"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::test_support::{FakeConnector, FakeSession};
    use crate::jobs::types::{DelayBounds, JobParams, TargetOutcome, TargetStatus};
    use outreach_core::ContactId;
    use outreach_protocol::{ConversationCursor, ConversationPage, ProtocolError, RemoteUser, SessionBlob, TransportConfig};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        config: EngineConfig,
        session: Arc<FakeSession>,
        connector: Arc<FakeConnector>,
        vault: Arc<SessionVault>,
        contacts: Arc<ContactStore>,
        resource: ResourceKey,
    }

    impl Harness {
        fn new(session: FakeSession) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = EngineConfig {
                data_dir: dir.path().to_path_buf(),
                ..EngineConfig::default()
            };
            let vault = Arc::new(SessionVault::new(dir.path().join("sessions")));
            let resource = ResourceKey::parse("1001").unwrap();
            vault
                .store(&resource, &SessionBlob(b"session".to_vec()))
                .unwrap();
            let session = Arc::new(session);
            Self {
                _dir: dir,
                config,
                connector: Arc::new(FakeConnector::new(session.clone())),
                session,
                vault,
                contacts: Arc::new(ContactStore::in_memory()),
                resource,
            }
        }

        fn manager(&self) -> JobManager {
            JobManager::open(
                &self.config,
                self.connector.clone(),
                self.vault.clone(),
                self.contacts.clone(),
            )
            .unwrap()
        }

        fn payload(&self, params: JobParams) -> JobPayload {
            JobPayload {
                session: self.vault.reference_for(&self.resource),
                transport: TransportConfig::default(),
                params,
            }
        }

        async fn start(&self, manager: &JobManager, params: JobParams) -> (Job, bool) {
            let kind = params.kind();
            manager
                .start_job(self.resource.clone(), kind, self.payload(params))
                .await
                .unwrap()
        }

        fn contact(&self, user: &RemoteUser) -> ContactId {
            self.contacts
                .upsert_many(&self.resource, std::slice::from_ref(user), &[])
                .unwrap()[0]
                .id
        }
    }

    async fn wait_terminal(manager: &JobManager, id: JobId) -> Job {
        for _ in 0..100_000 {
            let job = manager.get_job(id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }

    fn verify(identifiers: &[&str], aliases: &[&str]) -> JobParams {
        JobParams::VerifyContacts {
            identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            labels: vec![],
        }
    }

    fn send(targets: Vec<ContactId>) -> JobParams {
        JobParams::SendMessages {
            message: "hello".into(),
            delay: DelayBounds::default(),
            targets,
        }
    }

    fn user(remote_id: i64) -> RemoteUser {
        RemoteUser::new(remote_id, remote_id * 10)
    }

    fn statuses(job: &Job) -> Vec<(String, TargetStatus)> {
        job.progress
            .results
            .iter()
            .map(|r| (r.target.clone(), r.status))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn verify_records_each_identifier_in_request_order() {
        let mut fake = FakeSession::default();
        fake.directory.insert("+1".into(), user(1));
        fake.directory.insert("+3".into(), user(3));
        fake.retry_later.insert("+2".into());
        fake.existing = vec![user(3)];
        fake.aliases.insert("alice".into(), user(9));
        let mut h = Harness::new(fake);
        h.config.jobs.batch_size = 2;
        let manager = h.manager();

        let (job, is_new) = h.start(&manager, verify(&["+1", "+2", "+1", "+3", "+4"], &["alice", "ghost"])).await;
        assert!(is_new);
        assert_eq!(job.progress.total, 7);

        let job = wait_terminal(&manager, job.id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            statuses(&job),
            vec![
                ("+1".into(), TargetStatus::Succeeded),
                ("+2".into(), TargetStatus::Failed),
                ("+1".into(), TargetStatus::Skipped),
                ("+3".into(), TargetStatus::Succeeded),
                ("+4".into(), TargetStatus::Skipped),
                ("@alice".into(), TargetStatus::Succeeded),
                ("@ghost".into(), TargetStatus::Skipped),
            ]
        );
        assert_eq!(job.progress.counters.succeeded, 3);
        assert_eq!(job.progress.counters.failed, 1);
        assert_eq!(job.progress.counters.skipped, 3);
        assert_eq!(job.progress.results[1].error.as_deref(), Some("retry later"));
        assert_eq!(job.progress.results[2].error.as_deref(), Some("duplicate"));

        let stored = h.contacts.list(&h.resource);
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().any(|c| c.remote_id == 1 && c.labels == vec!["phone"]));
        assert!(stored.iter().any(|c| c.remote_id == 9 && c.labels == vec!["username"]));

        // Only the relationship the job created is removed.
        assert!(h.session.calls().contains(&"remove:1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn large_verify_runs_in_batches_and_fails_only_retry_later() {
        let mut fake = FakeSession::default();
        let identifiers: Vec<String> = (0..130).map(|n| format!("+{}", 1000 + n)).collect();
        for (n, id) in identifiers.iter().enumerate() {
            if [5, 70, 129].contains(&n) {
                fake.retry_later.insert(id.clone());
            } else {
                fake.directory.insert(id.clone(), user(n as i64 + 1));
            }
        }
        let h = Harness::new(fake);
        assert_eq!(h.config.jobs.batch_size, 15);
        let manager = h.manager();

        let refs: Vec<&str> = identifiers.iter().map(String::as_str).collect();
        let (job, _) = h.start(&manager, verify(&refs, &[])).await;
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.total, 130);
        assert_eq!(job.progress.counters.succeeded, 127);
        assert_eq!(job.progress.counters.failed, 3);
        assert_eq!(job.progress.counters.skipped, 0);
        let targets: Vec<&str> = job.progress.results.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, refs);
        let verifies = h.session.calls().iter().filter(|c| c.starts_with("bulk_verify")).count();
        assert_eq!(verifies, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_without_targets_complete_at_once() {
        let h = Harness::new(FakeSession::default().gated());
        let a = h.contact(&user(1));
        let manager = h.manager();

        // Hold the account's connection so a lease wait would show.
        let (busy, _) = h.start(&manager, send(vec![a])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.get_job(busy.id).unwrap().status, JobStatus::Running);

        let sessionless = |params| JobPayload {
            session: h.vault.reference_for(&ResourceKey::parse("77").unwrap()),
            transport: TransportConfig::default(),
            params,
        };
        for params in [verify(&["  ", ""], &[" @ "]), send(vec![])] {
            let kind = params.kind();
            let (job, _) = manager
                .start_job(h.resource.clone(), kind, sessionless(params))
                .await
                .unwrap();
            assert_eq!(job.progress.total, 0);

            tokio::time::sleep(Duration::from_millis(50)).await;
            let job = manager.get_job(job.id).unwrap();
            assert_eq!(job.status, JobStatus::Completed, "{kind}");
            assert!(job.error.is_none());
            assert_eq!(job.progress.counters.processed(), 0);
        }
        assert_eq!(h.connector.opened.load(std::sync::atomic::Ordering::SeqCst), 1);

        h.session.release(1);
        assert_eq!(wait_terminal(&manager, busy.id).await.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_error_fails_the_batch_and_continues() {
        let mut fake = FakeSession::default();
        fake.directory.insert("+3".into(), user(3));
        let mut h = Harness::new(fake);
        h.config.jobs.batch_size = 2;
        h.session.fail_next("bulk_verify", ProtocolError::rejected("phone number invalid"));
        let manager = h.manager();

        let (job, _) = h.start(&manager, verify(&["+1", "+2", "+3"], &[])).await;
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.progress.results[0],
            TargetOutcome::failed("+1", "phone number invalid")
        );
        assert_eq!(job.progress.results[1].status, TargetStatus::Failed);
        assert_eq!(job.progress.results[2].status, TargetStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_and_retries() {
        let mut fake = FakeSession::default();
        fake.directory.insert("+1".into(), user(1));
        let h = Harness::new(fake);
        h.session.fail_next("bulk_verify", ProtocolError::rate_limited(Duration::from_secs(30)));
        let manager = h.manager();

        let started = Instant::now();
        let (job, _) = h.start(&manager, verify(&["+1"], &[])).await;
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.progress.counters.succeeded, 1);
        assert!(started.elapsed() >= Duration::from_secs(30));
        let verifies = h.session.calls().iter().filter(|c| c.starts_with("bulk_verify")).count();
        assert_eq!(verifies, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_active_kind_returns_the_running_job() {
        let mut fake = FakeSession::default();
        fake.directory.insert("+1".into(), user(1));
        let h = Harness::new(fake.gated());
        let manager = h.manager();

        let (first, created) = h.start(&manager, verify(&["+1"], &[])).await;
        let (second, created_again) = h.start(&manager, verify(&["+2"], &[])).await;
        assert!(created);
        assert!(!created_again);
        assert_eq!(first.id, second.id);

        h.session.release(1);
        let done = wait_terminal(&manager, first.id).await;
        assert_eq!(done.status, JobStatus::Completed);

        let (third, created) = h.start(&manager, verify(&["+1"], &[])).await;
        assert!(created);
        assert_ne!(third.id, first.id);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_aborts_and_keeps_partial_progress() {
        let mut fake = FakeSession::default();
        fake.directory.insert("+1".into(), user(1));
        let mut h = Harness::new(fake);
        h.config.jobs.batch_size = 1;
        h.session.fail_after("bulk_verify", 1, ProtocolError::SessionRevoked);
        let manager = h.manager();

        let (job, _) = h.start(&manager, verify(&["+1", "+2", "+3"], &[])).await;
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error.as_deref(),
            Some("session expired or revoked - please re-authenticate this account")
        );
        assert_eq!(job.progress.results.len(), 1);
        assert_eq!(job.progress.total, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_session_fails_the_job() {
        let h = Harness::new(FakeSession::default());
        let manager = h.manager();
        let payload = JobPayload {
            session: h.vault.reference_for(&ResourceKey::parse("77").unwrap()),
            transport: TransportConfig::default(),
            params: verify(&["+1"], &[]),
        };

        let (job, _) = manager
            .start_job(h.resource.clone(), JobKind::VerifyContacts, payload)
            .await
            .unwrap();
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error.as_deref(),
            Some("session not found - please re-authenticate this account")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_the_job_with_its_duration() {
        let mut fake = FakeSession::default();
        fake.directory.insert("+1".into(), user(1));
        let mut h = Harness::new(fake.gated());
        h.config.jobs.verify.timeout = Duration::from_secs(90);
        let manager = h.manager();

        let (job, _) = h.start(&manager, verify(&["+1"], &[])).await;
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("job timed out after 90s"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_running_jobs() {
        let mut fake = FakeSession::default();
        fake.directory.insert("+1".into(), user(1));
        let h = Harness::new(fake.gated());
        let manager = h.manager();

        let (job, _) = h.start(&manager, verify(&["+1"], &[])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.shutdown().await;

        let job = manager.get_job(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("job cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn send_skips_duplicates_and_reports_unknown_contacts() {
        let h = Harness::new(FakeSession::default());
        let a = h.contact(&user(1));
        let b = h.contact(&user(2));
        let unknown = ContactId::new();
        let manager = h.manager();

        let (job, _) = h.start(&manager, send(vec![a, b, a, unknown])).await;
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.progress.results,
            vec![
                TargetOutcome::succeeded(a.to_string()),
                TargetOutcome::succeeded(b.to_string()),
                TargetOutcome::duplicate(a.to_string()),
                TargetOutcome::failed(unknown.to_string(), "contact not found"),
            ]
        );
        let sends: Vec<String> = h
            .session
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("send:"))
            .collect();
        assert_eq!(sends, vec!["send:1", "send:2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_falls_back_to_alias_on_stale_peer() {
        let mut fake = FakeSession::default();
        let mut stale = user(5);
        stale.alias = Some("dana".into());
        let mut fresh = stale.clone();
        fresh.access_hash += 1;
        fake.stale_peers.insert((stale.remote_id, stale.access_hash));
        fake.aliases.insert("dana".into(), fresh);
        let mut plain = user(6);
        plain.alias = None;
        fake.stale_peers.insert((plain.remote_id, plain.access_hash));

        let h = Harness::new(fake);
        let with_alias = h.contact(&stale);
        let without_alias = h.contact(&plain);
        let manager = h.manager();

        let (job, _) = h.start(&manager, send(vec![with_alias, without_alias])).await;
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.progress.results[0].status, TargetStatus::Succeeded);
        assert_eq!(
            job.progress.results[1],
            TargetOutcome::failed(without_alias.to_string(), "peer is invalid")
        );
        assert!(h.session.calls().contains(&"resolve:dana".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn send_pauses_between_targets_but_not_after_the_last() {
        let h = Harness::new(FakeSession::default());
        let a = h.contact(&user(1));
        let b = h.contact(&user(2));
        let manager = h.manager();

        let started = Instant::now();
        let (job, _) = h.start(
            &manager,
            JobParams::SendMessages {
                message: "hi".into(),
                delay: DelayBounds { min_ms: 2_000, max_ms: 2_000 },
                targets: vec![a, b],
            },
        ).await;
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.progress.counters.succeeded, 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn send_does_not_pause_after_the_last_delivery() {
        let h = Harness::new(FakeSession::default());
        let a = h.contact(&user(1));
        let b = h.contact(&user(2));
        let unknown = ContactId::new();
        let manager = h.manager();

        let started = Instant::now();
        let (job, _) = h
            .start(
                &manager,
                JobParams::SendMessages {
                    message: "hi".into(),
                    delay: DelayBounds { min_ms: 2_000, max_ms: 2_000 },
                    targets: vec![a, b, a, unknown],
                },
            )
            .await;
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.progress.counters.succeeded, 2);
        assert_eq!(job.progress.counters.skipped, 1);
        assert_eq!(job.progress.counters.failed, 1);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_on_one_account_share_the_connection_in_turn() {
        let h = Harness::new(FakeSession::default().gated());
        let a = h.contact(&user(1));
        let manager = h.manager();

        let (first, _) = h.start(&manager, send(vec![a])).await;
        let (second, created) = h.start(&manager, send(vec![a])).await;
        assert!(created);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut states = vec![
            manager.get_job(first.id).unwrap().status,
            manager.get_job(second.id).unwrap().status,
        ];
        states.sort_by_key(|s| *s == JobStatus::Running);
        assert_eq!(states, vec![JobStatus::Pending, JobStatus::Running]);

        h.session.release(2);
        assert_eq!(wait_terminal(&manager, first.id).await.status, JobStatus::Completed);
        assert_eq!(wait_terminal(&manager, second.id).await.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_reruns_only_failed_targets() {
        let mut fake = FakeSession::default();
        fake.directory.insert("+1".into(), user(1));
        fake.retry_later.insert("+2".into());
        let h = Harness::new(fake);
        let manager = h.manager();

        let (job, _) = h.start(&manager, verify(&["+1", "+2", "+3"], &[])).await;
        let job = wait_terminal(&manager, job.id).await;

        let (retry, created) = manager.retry_failed(job.id).await.unwrap();
        assert!(created);
        assert_eq!(retry.progress.total, 1);
        assert_eq!(retry.payload.params, verify(&["+2"], &[]));

        let retry = wait_terminal(&manager, retry.id).await;
        assert_eq!(statuses(&retry), vec![("+2".into(), TargetStatus::Failed)]);

        let (clean, _) = h.start(&manager, verify(&["+1"], &[])).await;
        let clean = wait_terminal(&manager, clean.id).await;
        assert!(matches!(
            manager.retry_failed(clean.id).await,
            Err(JobError::NothingToRetry)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_is_rejected_for_imports_and_active_jobs() {
        let h = Harness::new(FakeSession::default().gated());
        let manager = h.manager();

        let (import, _) = h.start(&manager, JobParams::ImportContacts { labels: vec![] }).await;
        let import = wait_terminal(&manager, import.id).await;
        assert!(matches!(
            manager.retry_failed(import.id).await,
            Err(JobError::RetryUnsupported(JobKind::ImportContacts))
        ));

        let (active, _) = h.start(&manager, verify(&["+1"], &[])).await;
        assert!(matches!(
            manager.retry_failed(active.id).await,
            Err(JobError::StillActive(_))
        ));
        assert!(matches!(
            manager.retry_failed(JobId::new()).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn conversation_import_pages_and_skips_known_peers() {
        let mut fake = FakeSession::default();
        fake.pages = vec![
            ConversationPage {
                users: vec![user(1), user(2)],
                next: Some(ConversationCursor("1".into())),
            },
            ConversationPage {
                users: vec![user(2), user(3)],
                next: None,
            },
        ];
        let h = Harness::new(fake);
        h.contact(&user(3));
        let manager = h.manager();

        let (job, _) = h.start(&manager, JobParams::ImportConversations { labels: vec![] }).await;
        let job = wait_terminal(&manager, job.id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.total, 4);
        assert_eq!(
            statuses(&job),
            vec![
                ("1".into(), TargetStatus::Succeeded),
                ("2".into(), TargetStatus::Succeeded),
                ("2".into(), TargetStatus::Skipped),
                ("3".into(), TargetStatus::Skipped),
            ]
        );
        assert_eq!(job.progress.results[3].error.as_deref(), Some("already imported"));
        let imported = h.contacts.list(&h.resource);
        assert!(imported.iter().any(|c| c.remote_id == 1 && c.labels == vec!["chat"]));
    }

    #[tokio::test]
    async fn invalid_payloads_are_rejected_before_anything_is_stored() {
        let h = Harness::new(FakeSession::default());
        let manager = h.manager();

        let blank = h.payload(JobParams::SendMessages {
            message: " ".into(),
            delay: DelayBounds::default(),
            targets: vec![],
        });
        assert!(matches!(
            manager.start_job(h.resource.clone(), JobKind::SendMessages, blank).await,
            Err(JobError::Invalid(_))
        ));

        let mismatched = h.payload(verify(&["+1"], &[]));
        assert!(matches!(
            manager.start_job(h.resource.clone(), JobKind::SendMessages, mismatched).await,
            Err(JobError::Invalid(_))
        ));

        let mut bad_proxy = h.payload(verify(&["+1"], &[]));
        bad_proxy.transport = TransportConfig::with_proxy("ftp://proxy:21");
        assert!(matches!(
            manager.start_job(h.resource.clone(), JobKind::VerifyContacts, bad_proxy).await,
            Err(JobError::Invalid(_))
        ));

        assert!(manager.get_jobs_by_resource(&h.resource).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_fails_jobs_left_running() {
        let mut fake = FakeSession::default();
        fake.directory.insert("+1".into(), user(1));
        let h = Harness::new(fake.gated());
        let previous = h.manager();
        let (job, _) = h.start(&previous, verify(&["+1"], &[])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(previous.get_job(job.id).unwrap().status, JobStatus::Running);
        let id = job.id;

        // A second process over the same data dir sees the job as abandoned.
        let reopened = h.manager();
        let job = reopened.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("interrupted by restart"));
        assert_eq!(reopened.get_jobs_by_resource(&h.resource).len(), 1);
    }
}
