//! `outreach-protocol`: the seam between the engine and the remote messaging service.
//!
//! The engine never speaks the wire protocol itself. Everything it needs from
//! the remote side (verification, relationship listing, message delivery, the
//! login exchange) goes through the traits in [`client`], and every failure is
//! classified into a [`ProtocolError`] so callers can tell rate limits, fatal
//! session problems and per-target failures apart.

pub mod client;
pub mod error;
pub mod transport;
pub mod types;

pub use client::{LoginChannel, LoginFlow, ProtocolConnector, ProtocolSession};
pub use error::{ProtocolError, ProtocolResult};
pub use transport::{ProxyEndpoint, ProxyScheme, TransportConfig};
pub use types::{
    AccountIdentity, ConversationCursor, ConversationPage, LoginCredential, LoginImport,
    RemoteUser, ResolvedIdentifier, SecondFactorChallenge, SecondFactorProof, SessionBlob,
    VerifyBatch,
};
