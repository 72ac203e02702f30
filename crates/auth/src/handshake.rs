//! Observable state of a login handshake.
//!
//! Transitions are methods on [`HandshakeSnapshot`] so that the account is
//! attached exactly when the status becomes `Success` and cleared otherwise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::{HandshakeToken, OwnerKey};

use crate::account::Account;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    /// Registered, no credential minted yet.
    Pending,
    /// A credential is published and waiting to be scanned.
    Scanning,
    /// Credential consumed; the account demands its second factor.
    PasswordRequired,
    Success,
    Error,
    Expired,
}

impl HandshakeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Expired)
    }

    /// Whether a read past `expires_at` should flip the session to `Expired`.
    ///
    /// `PasswordRequired` has its own secret timeout and is left alone.
    pub fn expires_lazily(self) -> bool {
        matches!(self, Self::Pending | Self::Scanning)
    }
}

/// Point-in-time view of one handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeSnapshot {
    pub token: HandshakeToken,
    pub owner: OwnerKey,
    pub status: HandshakeStatus,
    /// Renderable login URI for the current credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_payload: Option<String>,
    /// The same URI as a scannable code, as a `data:` URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_image: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<Account>,
}

impl HandshakeSnapshot {
    pub fn pending(token: HandshakeToken, owner: OwnerKey, expires_at: DateTime<Utc>) -> Self {
        Self {
            token,
            owner,
            status: HandshakeStatus::Pending,
            qr_payload: None,
            qr_image: None,
            expires_at,
            error: None,
            account: None,
        }
    }

    /// Publish a fresh credential. A stale image never outlives its URI.
    pub fn show_credential(&mut self, qr_payload: String, qr_image: Option<String>) {
        self.status = HandshakeStatus::Scanning;
        self.qr_payload = Some(qr_payload);
        self.qr_image = qr_image;
        self.error = None;
    }

    /// Enter (or re-enter) the second-factor round. `error` explains a previous rejection.
    pub fn require_secret(&mut self, expires_at: DateTime<Utc>, error: Option<String>) {
        self.status = HandshakeStatus::PasswordRequired;
        self.expires_at = expires_at;
        self.error = error;
    }

    pub fn succeed(&mut self, account: Account) {
        self.status = HandshakeStatus::Success;
        self.account = Some(account);
        self.error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = HandshakeStatus::Error;
        self.account = None;
        self.error = Some(error.into());
    }

    pub fn expire(&mut self, error: impl Into<String>) {
        self.status = HandshakeStatus::Expired;
        self.account = None;
        self.error = Some(error.into());
    }

    /// Lazy expiry check performed on read. Returns true when the status flipped.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.expires_lazily() && now > self.expires_at {
            self.expire("login code expired");
            return true;
        }
        false
    }
}
