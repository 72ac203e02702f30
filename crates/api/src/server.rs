//! Process bootstrap: open the engine, serve HTTP, shut down cleanly.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use outreach_infra::Engine;
use outreach_protocol::ProtocolConnector;

use crate::app::{build_app, services::AppServices};
use crate::config::AppConfig;

/// Serve until Ctrl-C, then cancel running jobs and wait for them to finalize.
pub async fn serve(config: AppConfig, connector: Arc<dyn ProtocolConnector>) -> anyhow::Result<()> {
    let engine = Engine::open(config.engine.clone(), connector).context("failed to open engine")?;
    let services = Arc::new(AppServices::new(engine));
    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("server error")?;

    services.engine.shutdown().await;
    Ok(())
}
