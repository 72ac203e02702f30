use std::sync::Arc;

use async_trait::async_trait;

use outreach_protocol::{
    LoginChannel, ProtocolConnector, ProtocolError, ProtocolResult, ProtocolSession, SessionBlob,
    TransportConfig,
};

/// Stand-in until a protocol driver is linked: every connection attempt fails.
struct NoDriver;

#[async_trait]
impl ProtocolConnector for NoDriver {
    async fn open_connection(
        &self,
        _session: &SessionBlob,
        _transport: &TransportConfig,
    ) -> ProtocolResult<Arc<dyn ProtocolSession>> {
        Err(ProtocolError::Connection("no protocol driver linked into this build".into()))
    }

    async fn begin_login(&self, _transport: &TransportConfig) -> ProtocolResult<LoginChannel> {
        Err(ProtocolError::Connection("no protocol driver linked into this build".into()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    outreach_observability::init();

    let config = outreach_api::AppConfig::from_env()?;
    tracing::warn!("running without a protocol driver; jobs and handshakes will fail to connect");

    outreach_api::serve(config, Arc::new(NoDriver)).await
}
