//! `outreach-auth`: linked accounts and the login handshake state model.
//!
//! Pure types only: the state machine that drives a handshake lives in
//! `outreach-infra`, this crate defines what a caller can observe.

pub mod account;
pub mod handshake;

pub use account::Account;
pub use handshake::{HandshakeSnapshot, HandshakeStatus};
