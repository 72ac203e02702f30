//! Process configuration: listen address plus the engine settings.

use std::net::SocketAddr;

use anyhow::Context;

use outreach_infra::config::EngineConfig;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Read `.env` (if present) and then the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let raw = lookup("OUTREACH_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = raw
            .parse()
            .with_context(|| format!("OUTREACH_LISTEN_ADDR: invalid socket address {raw:?}"))?;
        let engine = EngineConfig::from_lookup(&lookup).context("invalid engine configuration")?;
        Ok(Self {
            listen_addr,
            engine,
        })
    }
}
