//! Protocol failure classification.

use std::time::Duration;

use thiserror::Error;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Failure reported by the remote service or the connection to it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The server asked us to pause before calling again.
    #[error("rate limited: retry after {}s", .wait.as_secs())]
    RateLimited { wait: Duration },

    /// The stored session is no longer accepted.
    #[error("session expired or revoked - please re-authenticate this account")]
    SessionRevoked,

    /// The connection could not be established or was lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The target's cached identity is stale and must be re-resolved.
    #[error("peer is invalid")]
    PeerInvalid,

    #[error("not found: {0}")]
    NotFound(String),

    /// The second-factor proof was rejected.
    #[error("invalid password")]
    InvalidSecondFactor,

    /// The caller gave up waiting (deadline or shutdown).
    #[error("operation cancelled")]
    Cancelled,

    /// Any other refusal, scoped to a single request.
    #[error("{0}")]
    Rejected(String),
}

impl ProtocolError {
    pub fn rate_limited(wait: Duration) -> Self {
        Self::RateLimited { wait }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Wait demanded by the server, when this is a rate-limit signal.
    pub fn rate_limit_wait(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait } => Some(*wait),
            _ => None,
        }
    }

    /// Errors after which the connection is unusable and the whole job must stop.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::SessionRevoked | Self::Connection(_))
    }
}
