//! HTTP control surface for the outreach engine.

pub mod app;
pub mod config;
pub mod middleware;
pub mod server;

pub use config::AppConfig;
pub use server::serve;
