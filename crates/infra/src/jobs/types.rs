//! Core job types.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use outreach_core::{ContactId, DomainError, DomainResult, Entity, ResourceKey};
use outreach_protocol::TransportConfig;

use crate::accounts::SessionRef;

pub use outreach_core::JobId;

/// Job family; selects the runner, the store file and the concurrency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    VerifyContacts,
    ImportConversations,
    ImportContacts,
    SendMessages,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::VerifyContacts,
        JobKind::ImportConversations,
        JobKind::ImportContacts,
        JobKind::SendMessages,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::VerifyContacts => "verify_contacts",
            JobKind::ImportConversations => "import_conversations",
            JobKind::ImportContacts => "import_contacts",
            JobKind::SendMessages => "send_messages",
        }
    }

    /// Imports re-read the whole source, so re-running failed targets makes no sense.
    pub fn supports_retry(self) -> bool {
        matches!(self, JobKind::VerifyContacts | JobKind::SendMessages)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job kind: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// What happened to one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub target: String,
    pub status: TargetStatus,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetOutcome {
    pub fn succeeded(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            status: TargetStatus::Succeeded,
            success: true,
            error: None,
        }
    }

    pub fn failed(target: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            status: TargetStatus::Failed,
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn skipped(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            status: TargetStatus::Skipped,
            success: false,
            error: Some(reason.into()),
        }
    }

    pub fn duplicate(target: impl Into<String>) -> Self {
        Self::skipped(target, "duplicate")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl JobCounters {
    pub fn record(&mut self, status: TargetStatus) {
        match status {
            TargetStatus::Succeeded => self.succeeded += 1,
            TargetStatus::Failed => self.failed += 1,
            TargetStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Counters and results as reported by a running job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: usize,
    #[serde(flatten)]
    pub counters: JobCounters,
    pub results: Vec<TargetOutcome>,
}

impl JobProgress {
    pub fn with_total(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn push(&mut self, outcome: TargetOutcome) {
        self.counters.record(outcome.status);
        self.results.push(outcome);
        // Discovered targets (imports) may arrive before `total` is raised.
        self.total = self.total.max(self.results.len());
    }
}

/// Uniform random pause between sends, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayBounds {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayBounds {
    pub fn validate(&self) -> DomainResult<()> {
        if self.min_ms > self.max_ms {
            return Err(DomainError::validation(
                "delay min_ms must not exceed max_ms",
            ));
        }
        Ok(())
    }

    pub fn is_zero(&self) -> bool {
        self.max_ms == 0
    }

    pub fn sample(&self) -> std::time::Duration {
        let ms = if self.min_ms >= self.max_ms {
            self.max_ms
        } else {
            rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
        };
        std::time::Duration::from_millis(ms)
    }
}

/// Kind-specific parameters, kept with the job so it can be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobParams {
    VerifyContacts {
        #[serde(default)]
        identifiers: Vec<String>,
        #[serde(default)]
        aliases: Vec<String>,
        #[serde(default)]
        labels: Vec<String>,
    },
    ImportConversations {
        #[serde(default)]
        labels: Vec<String>,
    },
    ImportContacts {
        #[serde(default)]
        labels: Vec<String>,
    },
    SendMessages {
        message: String,
        #[serde(default)]
        delay: DelayBounds,
        targets: Vec<ContactId>,
    },
}

impl JobParams {
    pub fn kind(&self) -> JobKind {
        match self {
            JobParams::VerifyContacts { .. } => JobKind::VerifyContacts,
            JobParams::ImportConversations { .. } => JobKind::ImportConversations,
            JobParams::ImportContacts { .. } => JobKind::ImportContacts,
            JobParams::SendMessages { .. } => JobKind::SendMessages,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        match self {
            JobParams::SendMessages { message, delay, .. } => {
                if message.trim().is_empty() {
                    return Err(DomainError::validation("message text is required"));
                }
                delay.validate()
            }
            _ => Ok(()),
        }
    }

    /// Whether the job works through a caller-supplied target list.
    pub fn has_target_list(&self) -> bool {
        matches!(
            self,
            JobParams::VerifyContacts { .. } | JobParams::SendMessages { .. }
        )
    }

    /// Targets in request order, as they will appear in `results`.
    ///
    /// Identifiers are trimmed and blanks dropped; aliases are normalized to `@name`.
    pub fn targets(&self) -> Vec<String> {
        match self {
            JobParams::VerifyContacts {
                identifiers,
                aliases,
                ..
            } => identifiers
                .iter()
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .chain(aliases.iter().filter_map(|a| normalize_alias(a)))
                .collect(),
            JobParams::SendMessages { targets, .. } => {
                targets.iter().map(ToString::to_string).collect()
            }
            JobParams::ImportConversations { .. } | JobParams::ImportContacts { .. } => Vec::new(),
        }
    }

    /// Same parameters narrowed to `keep` (a subset of [`targets`](Self::targets)).
    pub fn retain_targets(&self, keep: &[String]) -> DomainResult<JobParams> {
        let wanted: HashSet<&str> = keep.iter().map(String::as_str).collect();
        match self {
            JobParams::VerifyContacts { labels, .. } => {
                let (aliases, identifiers): (Vec<String>, Vec<String>) = self
                    .targets()
                    .into_iter()
                    .filter(|t| wanted.contains(t.as_str()))
                    .partition(|t| t.starts_with('@'));
                Ok(JobParams::VerifyContacts {
                    identifiers: dedup_in_order(identifiers),
                    aliases: dedup_in_order(aliases),
                    labels: labels.clone(),
                })
            }
            JobParams::SendMessages {
                message,
                delay,
                targets,
            } => {
                let mut seen = HashSet::new();
                let targets = targets
                    .iter()
                    .filter(|id| wanted.contains(id.to_string().as_str()) && seen.insert(**id))
                    .copied()
                    .collect();
                Ok(JobParams::SendMessages {
                    message: message.clone(),
                    delay: *delay,
                    targets,
                })
            }
            other => Err(DomainError::validation(format!(
                "{} jobs have no target list",
                other.kind()
            ))),
        }
    }
}

/// `"@Name "` / `"name"` -> `"@Name"`; blank input is dropped.
pub fn normalize_alias(raw: &str) -> Option<String> {
    let name = raw.trim().trim_start_matches('@').trim();
    if name.is_empty() {
        None
    } else {
        Some(format!("@{name}"))
    }
}

fn dedup_in_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|i| seen.insert(i.clone()))
        .collect()
}

/// Everything a job needs to run (and to be retried later).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub session: SessionRef,
    #[serde(default)]
    pub transport: TransportConfig,
    pub params: JobParams,
}

/// A background batch operation against one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub resource: ResourceKey,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(flatten)]
    pub progress: JobProgress,
    pub payload: JobPayload,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// A Pending job whose total is the number of requested targets.
    pub fn new(resource: ResourceKey, kind: JobKind, payload: JobPayload) -> Self {
        let now = Utc::now();
        let total = payload.params.targets().len();
        Self {
            id: JobId::new(),
            resource,
            kind,
            status: JobStatus::Pending,
            progress: JobProgress::with_total(total),
            payload,
            started_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.updated_at = Utc::now();
    }

    /// Terminal write. Callers guarantee this happens once.
    pub fn finish(&mut self, status: JobStatus, progress: JobProgress, error: Option<String>) {
        self.status = status;
        self.progress = progress;
        self.error = error;
        self.updated_at = Utc::now();
    }

    /// Crash recovery: a job found Pending/Running at load time never finished.
    pub fn reconcile_interrupted(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some("interrupted by restart".to_string());
        self.updated_at = Utc::now();
        true
    }

    /// Targets whose recorded outcome was a failure, in request order, without repeats.
    pub fn failed_targets(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.progress
            .results
            .iter()
            .filter(|r| r.status == TargetStatus::Failed)
            .filter(|r| seen.insert(r.target.as_str()))
            .map(|r| r.target.clone())
            .collect()
    }
}

impl Entity for Job {
    type Id = JobId;

    fn id(&self) -> &JobId {
        &self.id
    }
}
