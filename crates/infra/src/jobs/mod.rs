//! Background jobs against linked accounts.
//!
//! A job is created Pending, persisted in the store for its kind, and driven
//! by one tokio task until it reaches Completed or Failed. The task holds the
//! account's connection lease while it runs, records one outcome per target
//! in request order, and finalizes exactly once (normal exit, fatal protocol
//! error, deadline, or engine shutdown).
//!
//! ## Components
//!
//! - `Job`, `JobParams`: what to do and what happened so far
//! - `JobStore`: snapshot-backed persistence, one file per kind
//! - `JobRunner`: per-kind target loop (verify, import, send)
//! - `JobManager`: validation, concurrency policy, spawning, retries

pub mod import;
pub mod manager;
pub mod runner;
pub mod send;
pub mod store;
pub mod types;
pub mod verify;

#[cfg(test)]
pub(crate) mod test_support;

pub use import::ImportRunner;
pub use manager::{JobError, JobManager};
pub use runner::{JobAbort, JobContext, JobRunner};
pub use send::SendRunner;
pub use store::{CreateOutcome, JobStore, JobStoreError, SnapshotJobStore};
pub use types::{
    normalize_alias, DelayBounds, Job, JobCounters, JobId, JobKind, JobParams, JobPayload,
    JobProgress, JobStatus, TargetOutcome, TargetStatus,
};
pub use verify::VerifyRunner;
