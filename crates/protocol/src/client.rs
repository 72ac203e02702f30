//! Client traits implemented by a concrete protocol driver.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::mpsc;

use crate::error::ProtocolResult;
use crate::transport::TransportConfig;
use crate::types::{
    AccountIdentity, ConversationCursor, ConversationPage, LoginCredential, LoginImport,
    RemoteUser, SecondFactorChallenge, SecondFactorProof, SessionBlob, VerifyBatch,
};

/// Entry point: opens authorized sessions and starts logins.
#[async_trait]
pub trait ProtocolConnector: Send + Sync + 'static {
    /// Open a connection authorized by a previously exported session.
    async fn open_connection(
        &self,
        session: &SessionBlob,
        transport: &TransportConfig,
    ) -> ProtocolResult<Arc<dyn ProtocolSession>>;

    /// Start an unauthenticated connection for the code-based login exchange.
    async fn begin_login(&self, transport: &TransportConfig) -> ProtocolResult<LoginChannel>;

    /// Whether one account's connection may be driven by several jobs at once.
    fn supports_concurrent_use(&self) -> bool {
        false
    }
}

/// An authorized connection acting on behalf of one account.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Look up a batch of phone numbers.
    async fn bulk_verify(&self, identifiers: &[String]) -> ProtocolResult<VerifyBatch>;

    /// Users already in the account's address book.
    async fn list_existing_relationships(&self) -> ProtocolResult<Vec<RemoteUser>>;

    /// Drop users from the account's address book.
    async fn remove_relationships(&self, users: &[RemoteUser]) -> ProtocolResult<()>;

    async fn send_message(&self, target: &RemoteUser, text: &str) -> ProtocolResult<()>;

    /// Resolve a public alias (without `@`). Unknown aliases yield `NotFound`.
    async fn resolve_alias(&self, alias: &str) -> ProtocolResult<RemoteUser>;

    async fn list_conversations(
        &self,
        cursor: Option<&ConversationCursor>,
    ) -> ProtocolResult<ConversationPage>;
}

/// A login in progress plus its out-of-band consumption signal.
///
/// The driver sends on `consumed` whenever the current credential has been
/// accepted on another device.
pub struct LoginChannel {
    pub flow: Box<dyn LoginFlow>,
    pub consumed: mpsc::Receiver<()>,
}

/// Steps of the code-based login exchange.
#[async_trait]
pub trait LoginFlow: Send + Sync {
    async fn export_login_credential(&self) -> ProtocolResult<LoginCredential>;

    async fn import_login_credential(&self, token: &[u8]) -> ProtocolResult<LoginImport>;

    async fn second_factor_challenge(&self) -> ProtocolResult<SecondFactorChallenge>;

    /// Compute the proof of knowledge for `secret`. The secret must not be retained.
    fn derive_proof(
        &self,
        challenge: &SecondFactorChallenge,
        secret: &SecretString,
    ) -> ProtocolResult<SecondFactorProof>;

    /// Rejected proofs yield `InvalidSecondFactor`.
    async fn submit_second_factor_proof(
        &self,
        proof: SecondFactorProof,
    ) -> ProtocolResult<AccountIdentity>;

    /// Export the now-authorized session for later `open_connection` calls.
    async fn export_session(&self) -> ProtocolResult<SessionBlob>;
}
