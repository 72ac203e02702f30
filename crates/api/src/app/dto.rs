use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_infra::jobs::{Job, JobId, JobKind, JobParams, JobStatus, TargetOutcome};

// -------------------------
// Request DTOs
// -------------------------

/// Job parameters tagged by `kind`, plus an optional per-job proxy.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(flatten)]
    pub params: JobParams,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartHandshakeRequest {
    pub owner: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitSecretRequest {
    pub secret: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub id: JobId,
    pub status: JobStatus,
    pub total: usize,
    pub is_new: bool,
}

impl JobAccepted {
    pub fn new(job: &Job, is_new: bool) -> Self {
        Self {
            id: job.id,
            status: job.status,
            total: job.progress.total,
            is_new,
        }
    }
}

/// Public view of a job; the session location stays server-side.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub resource: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<TargetOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            resource: job.resource.to_string(),
            kind: job.kind,
            status: job.status,
            total: job.progress.total,
            succeeded: job.progress.counters.succeeded,
            failed: job.progress.counters.failed,
            skipped: job.progress.counters.skipped,
            results: job.progress.results,
            error: job.error,
            started_at: job.started_at,
            updated_at: job.updated_at,
        }
    }
}
