//! Engine configuration and environment loading.
//!
//! Every knob has a default; `from_env` overrides from `OUTREACH_*` variables.

use std::path::PathBuf;
use std::time::Duration;

use outreach_protocol::TransportConfig;

use crate::jobs::JobKind;
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected {expected}, got {value:?}")]
    Invalid {
        var: String,
        expected: &'static str,
        value: String,
    },
}

/// Concurrency, durability and deadline rules for one job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    /// At most one Pending/Running job per account for this kind.
    pub single_active: bool,
    /// Jobs are written to `jobs-<kind>.json` and reconciled on restart.
    pub durable: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    /// Identifiers per bulk verification call.
    pub batch_size: usize,
    /// Jobs kept per account and kind when cleaning up.
    pub keep_per_resource: usize,
    pub retry: RetryPolicy,
    pub verify: KindPolicy,
    pub import_conversations: KindPolicy,
    pub import_contacts: KindPolicy,
    pub send: KindPolicy,
}

impl Default for JobsConfig {
    fn default() -> Self {
        const HOUR: Duration = Duration::from_secs(60 * 60);
        Self {
            batch_size: 15,
            keep_per_resource: 50,
            retry: RetryPolicy::default(),
            verify: KindPolicy {
                single_active: true,
                durable: true,
                timeout: HOUR,
            },
            import_conversations: KindPolicy {
                single_active: true,
                durable: true,
                timeout: 6 * HOUR,
            },
            import_contacts: KindPolicy {
                single_active: true,
                durable: true,
                timeout: 6 * HOUR,
            },
            send: KindPolicy {
                single_active: false,
                durable: true,
                timeout: HOUR,
            },
        }
    }
}

impl JobsConfig {
    pub fn policy(&self, kind: JobKind) -> KindPolicy {
        match kind {
            JobKind::VerifyContacts => self.verify,
            JobKind::ImportConversations => self.import_conversations,
            JobKind::ImportContacts => self.import_contacts,
            JobKind::SendMessages => self.send,
        }
    }

    fn policy_mut(&mut self, kind: JobKind) -> &mut KindPolicy {
        match kind {
            JobKind::VerifyContacts => &mut self.verify,
            JobKind::ImportConversations => &mut self.import_conversations,
            JobKind::ImportContacts => &mut self.import_contacts,
            JobKind::SendMessages => &mut self.send,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Lifetime of a session before a read may expire it.
    pub session_ttl: Duration,
    /// Hard cap on the whole exchange.
    pub overall_timeout: Duration,
    /// How long to wait for a second-factor secret per round.
    pub secret_timeout: Duration,
    /// How long `start` waits for the first credential.
    pub startup_grace: Duration,
    /// How long a finished session stays queryable.
    pub retention: Duration,
    /// Wait used when a credential arrives already expired.
    pub fallback_credential_ttl: Duration,
    /// Scheme of the rendered login URI (`<scheme>://login?token=...`).
    pub login_uri_scheme: String,
    pub transport: TransportConfig,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(5 * 60),
            overall_timeout: Duration::from_secs(10 * 60),
            secret_timeout: Duration::from_secs(5 * 60),
            startup_grace: Duration::from_secs(3),
            retention: Duration::from_secs(30),
            fallback_credential_ttl: Duration::from_secs(30),
            login_uri_scheme: "tg".to_string(),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root for snapshots and session files.
    pub data_dir: PathBuf,
    /// Transport used for job connections unless a request overrides it.
    pub transport: TransportConfig,
    pub jobs: JobsConfig,
    pub handshake: HandshakeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".data"),
            transport: TransportConfig::default(),
            jobs: JobsConfig::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source (the process env in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(&lookup);
        let mut cfg = Self::default();

        if let Some(dir) = env.string("OUTREACH_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(proxy) = env.string("OUTREACH_PROXY_URL") {
            cfg.transport = TransportConfig::with_proxy(proxy);
            cfg.handshake.transport = cfg.transport.clone();
        }

        if let Some(n) = env.parse::<usize>("OUTREACH_VERIFY_BATCH_SIZE", "a positive integer")? {
            if n == 0 {
                return Err(env.invalid("OUTREACH_VERIFY_BATCH_SIZE", "a positive integer"));
            }
            cfg.jobs.batch_size = n;
        }
        if let Some(n) = env.parse::<usize>("OUTREACH_JOBS_KEEP_PER_ACCOUNT", "an integer")? {
            cfg.jobs.keep_per_resource = n;
        }
        if let Some(secs) = env.parse::<u64>("OUTREACH_RATE_LIMIT_BUDGET_SECS", "seconds")? {
            cfg.jobs.retry = match secs {
                0 => RetryPolicy::unbounded(),
                s => RetryPolicy::with_budget(Duration::from_secs(s)),
            };
        }

        for kind in JobKind::ALL {
            let prefix = format!("OUTREACH_{}", kind.as_str().to_ascii_uppercase());
            let policy = cfg.jobs.policy_mut(kind);
            if let Some(v) = env.flag(&format!("{prefix}_SINGLE_ACTIVE"))? {
                policy.single_active = v;
            }
            if let Some(v) = env.flag(&format!("{prefix}_DURABLE"))? {
                policy.durable = v;
            }
            if let Some(secs) = env.parse::<u64>(&format!("{prefix}_TIMEOUT_SECS"), "seconds")? {
                policy.timeout = Duration::from_secs(secs);
            }
        }

        if let Some(scheme) = env.string("OUTREACH_LOGIN_URI_SCHEME") {
            cfg.handshake.login_uri_scheme = scheme;
        }
        if let Some(secs) = env.parse::<u64>("OUTREACH_HANDSHAKE_TTL_SECS", "seconds")? {
            cfg.handshake.session_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("OUTREACH_HANDSHAKE_TIMEOUT_SECS", "seconds")? {
            cfg.handshake.overall_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("OUTREACH_SECRET_TIMEOUT_SECS", "seconds")? {
            cfg.handshake.secret_timeout = Duration::from_secs(secs);
        }

        Ok(cfg)
    }
}

struct Lookup<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn invalid(&self, var: &str, expected: &'static str) -> ConfigError {
        ConfigError::Invalid {
            var: var.to_string(),
            expected,
            value: self.string(var).unwrap_or_default(),
        }
    }

    fn parse<T: std::str::FromStr>(
        &self,
        var: &str,
        expected: &'static str,
    ) -> Result<Option<T>, ConfigError> {
        match self.string(var) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(var, expected)),
        }
    }

    fn flag(&self, var: &str) -> Result<Option<bool>, ConfigError> {
        match self.string(var).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => Ok(None),
            Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
            Some("0" | "false" | "no" | "off") => Ok(Some(false)),
            Some(_) => Err(self.invalid(var, "a boolean")),
        }
    }
}
