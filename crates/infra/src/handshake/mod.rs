//! Code-based login handshakes that link new accounts.
//!
//! Each handshake is an in-memory session keyed by an unguessable token and
//! driven by one task. Callers poll [`HandshakeManager::status`]; a session
//! waiting for its second factor receives the secret through a one-shot slot
//! that is re-opened for every attempt. Sessions are never persisted.

mod flow;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use outreach_auth::{HandshakeSnapshot, HandshakeStatus};
use outreach_core::{HandshakeToken, OwnerKey};
use outreach_protocol::ProtocolConnector;

use crate::accounts::{AccountStore, SessionVault};
use crate::config::HandshakeConfig;
use crate::retry::RetryPolicy;

pub use flow::{login_uri, render_qr};

const STARTUP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake not found")]
    NotFound,
    #[error("no handshake awaiting secret")]
    NotAwaitingSecret,
    #[error("secret already submitted")]
    SecretPending,
}

/// Hand-off point for the second-factor secret.
enum SecretSlot {
    Closed,
    Open(oneshot::Sender<SecretString>),
    /// A secret was handed over and is being checked.
    Submitted,
}

struct Entry {
    snapshot: HandshakeSnapshot,
    cancel: CancellationToken,
    secret: SecretSlot,
}

struct Shared {
    sessions: RwLock<HashMap<HandshakeToken, Entry>>,
    connector: Arc<dyn ProtocolConnector>,
    accounts: Arc<AccountStore>,
    vault: Arc<SessionVault>,
    config: HandshakeConfig,
    retry: RetryPolicy,
}

impl Shared {
    /// Apply `f` to a live, non-terminal session.
    fn update(&self, token: HandshakeToken, f: impl FnOnce(&mut Entry)) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = sessions.get_mut(&token) {
            if !entry.snapshot.status.is_terminal() {
                f(entry);
            }
        }
    }

    fn snapshot(&self, token: HandshakeToken) -> Option<HandshakeSnapshot> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(&token).map(|e| e.snapshot.clone())
    }

    fn remove(&self, token: HandshakeToken) -> Option<Entry> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(&token)
    }
}

/// `now + d` on the wall clock used for `expires_at`.
fn after(d: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}

#[derive(Clone)]
pub struct HandshakeManager {
    shared: Arc<Shared>,
}

impl HandshakeManager {
    pub fn new(
        config: HandshakeConfig,
        retry: RetryPolicy,
        connector: Arc<dyn ProtocolConnector>,
        accounts: Arc<AccountStore>,
        vault: Arc<SessionVault>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sessions: RwLock::new(HashMap::new()),
                connector,
                accounts,
                vault,
                config,
                retry,
            }),
        }
    }

    /// Register a session, spawn its task and wait briefly for the first credential.
    pub async fn start(&self, owner: OwnerKey) -> HandshakeSnapshot {
        let config = &self.shared.config;
        let token = HandshakeToken::new();
        let cancel = CancellationToken::new();
        let mut last = HandshakeSnapshot::pending(token, owner.clone(), after(config.session_ttl));

        {
            let mut sessions = self
                .shared
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            sessions.insert(
                token,
                Entry {
                    snapshot: last.clone(),
                    cancel: cancel.clone(),
                    secret: SecretSlot::Closed,
                },
            );
        }
        info!(token = %token, owner = %owner, "handshake started");

        let span = info_span!("handshake", token = %token);
        tokio::spawn(flow::drive(self.shared.clone(), token, owner, cancel).instrument(span));

        let grace_ends = Instant::now() + config.startup_grace;
        while last.status == HandshakeStatus::Pending && Instant::now() < grace_ends {
            tokio::time::sleep(STARTUP_POLL).await;
            match self.shared.snapshot(token) {
                Some(s) => last = s,
                None => break,
            }
        }
        last
    }

    /// Current state. A Pending or Scanning session past `expires_at` is expired here.
    pub fn status(&self, token: HandshakeToken) -> Result<HandshakeSnapshot, HandshakeError> {
        let mut sessions = self
            .shared
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = sessions.get_mut(&token).ok_or(HandshakeError::NotFound)?;
        if entry.snapshot.expire_if_due(Utc::now()) {
            entry.cancel.cancel();
            entry.secret = SecretSlot::Closed;
            info!(token = %token, "handshake expired on read");
        }
        Ok(entry.snapshot.clone())
    }

    /// Hand the second-factor secret to the waiting task. Never stored.
    pub fn submit_secret(
        &self,
        token: HandshakeToken,
        secret: SecretString,
    ) -> Result<(), HandshakeError> {
        let mut sessions = self
            .shared
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = sessions.get_mut(&token).ok_or(HandshakeError::NotFound)?;
        if entry.snapshot.status != HandshakeStatus::PasswordRequired {
            return Err(HandshakeError::NotAwaitingSecret);
        }
        match std::mem::replace(&mut entry.secret, SecretSlot::Submitted) {
            SecretSlot::Open(tx) => {
                if tx.send(secret).is_err() {
                    entry.secret = SecretSlot::Closed;
                    return Err(HandshakeError::NotAwaitingSecret);
                }
                Ok(())
            }
            SecretSlot::Submitted => Err(HandshakeError::SecretPending),
            SecretSlot::Closed => {
                entry.secret = SecretSlot::Closed;
                Err(HandshakeError::NotAwaitingSecret)
            }
        }
    }

    /// Stop the task and forget the session.
    pub fn cancel(&self, token: HandshakeToken) -> Result<(), HandshakeError> {
        let entry = self.shared.remove(token).ok_or(HandshakeError::NotFound)?;
        entry.cancel.cancel();
        info!(token = %token, "handshake cancelled");
        Ok(())
    }

    /// Cancel every session.
    pub fn shutdown(&self) {
        let mut sessions = self
            .shared
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in sessions.drain() {
            entry.cancel.cancel();
        }
    }
}
