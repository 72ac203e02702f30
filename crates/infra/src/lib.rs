//! Infrastructure layer: snapshot storage, the job engine, login handshakes, config.

pub mod accounts;
pub mod config;
pub mod contacts;
pub mod engine;
pub mod handshake;
pub mod jobs;
pub mod leases;
pub mod retry;
pub mod snapshot;

pub use engine::{Engine, EngineError};
