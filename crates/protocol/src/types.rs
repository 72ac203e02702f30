//! Wire-neutral values exchanged with the remote service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user known to the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub remote_id: i64,
    /// Per-account capability needed to address the user.
    pub access_hash: i64,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    /// Public alias, without the leading `@`.
    #[serde(default)]
    pub alias: Option<String>,
}

impl RemoteUser {
    pub fn new(remote_id: i64, access_hash: i64) -> Self {
        Self {
            remote_id,
            access_hash,
            phone: None,
            first_name: String::new(),
            last_name: String::new(),
            alias: None,
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// An identifier from a verify request that matched a remote user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentifier {
    pub identifier: String,
    pub user: RemoteUser,
}

/// Outcome of one bulk verification round.
///
/// Every submitted identifier appears in exactly one of the three lists;
/// the client puts identifiers it never heard back about in `unresolved`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyBatch {
    pub resolved: Vec<ResolvedIdentifier>,
    pub unresolved: Vec<String>,
    /// Identifiers the server declined to answer for now.
    pub retry_later: Vec<String>,
}

/// Opaque position in the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCursor(pub String);

/// One page of private conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationPage {
    pub users: Vec<RemoteUser>,
    /// `None` once the list is exhausted.
    pub next: Option<ConversationCursor>,
}

/// Short-lived login token to be presented out-of-band (e.g. scanned from a code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginCredential {
    pub token: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

/// Profile of the account that just logged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub remote_id: i64,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

/// Result of importing a consumed login credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginImport {
    Success(AccountIdentity),
    SecondFactorRequired,
    /// The account lives on another datacenter.
    Migrate { datacenter: i32 },
}

/// Server parameters for the second-factor proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondFactorChallenge {
    pub hint: Option<String>,
    pub params: Vec<u8>,
}

/// Proof-of-knowledge derived from the secret and a challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct SecondFactorProof(pub Vec<u8>);

impl std::fmt::Debug for SecondFactorProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecondFactorProof(..)")
    }
}

/// Serialized authorized session, as exported after a successful login.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionBlob(pub Vec<u8>);

impl std::fmt::Debug for SessionBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionBlob({} bytes)", self.0.len())
    }
}
