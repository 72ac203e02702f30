//! `outreach-core`: shared building blocks for the outreach engine.
//!
//! This crate contains **pure** primitives (identifiers, the domain error
//! model); it has no runtime, I/O or protocol concerns.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{ContactId, HandshakeToken, JobId, OwnerKey, ResourceKey};
