//! The login exchange driven by one handshake task.

use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use chrono::Utc;
use qrcode::render::svg;
use qrcode::types::QrError;
use qrcode::QrCode;
use secrecy::SecretString;
use tokio::sync::oneshot;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use outreach_auth::Account;
use outreach_core::{HandshakeToken, OwnerKey};
use outreach_protocol::{AccountIdentity, LoginChannel, LoginFlow, LoginImport, ProtocolError};

use super::{after, SecretSlot, Shared};

/// Why a handshake stopped short of `Success`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum FlowEnd {
    Cancelled,
    Expired(String),
    Failed(String),
}

impl From<ProtocolError> for FlowEnd {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Cancelled => FlowEnd::Cancelled,
            other => FlowEnd::Failed(other.to_string()),
        }
    }
}

const QR_SIZE: u32 = 256;

/// `<scheme>://login?token=<base64url>`
pub fn login_uri(scheme: &str, token: &[u8]) -> String {
    format!("{scheme}://login?token={}", URL_SAFE.encode(token))
}

/// `uri` as an SVG QR code wrapped in a `data:image/svg+xml;base64,` URI.
pub fn render_qr(uri: &str) -> Result<String, QrError> {
    let image = QrCode::new(uri.as_bytes())?
        .render::<svg::Color>()
        .min_dimensions(QR_SIZE, QR_SIZE)
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}

/// Run the exchange under the overall deadline, record how it ended, then
/// keep the session queryable for the retention period.
pub(super) async fn drive(
    shared: Arc<Shared>,
    token: HandshakeToken,
    owner: OwnerKey,
    cancel: CancellationToken,
) {
    let end = tokio::select! {
        r = run(&shared, token, &owner, &cancel) => r.err(),
        _ = cancel.cancelled() => Some(FlowEnd::Cancelled),
        _ = sleep(shared.config.overall_timeout) => Some(FlowEnd::Expired("handshake timed out".to_string())),
    };

    match end {
        None => {}
        Some(FlowEnd::Cancelled) => debug!("handshake cancelled"),
        Some(FlowEnd::Expired(msg)) => {
            info!(reason = %msg, "handshake expired");
            shared.update(token, |entry| {
                entry.snapshot.expire(msg);
                entry.secret = SecretSlot::Closed;
            });
        }
        Some(FlowEnd::Failed(msg)) => {
            warn!(error = %msg, "handshake failed");
            shared.update(token, |entry| {
                entry.snapshot.fail(msg);
                entry.secret = SecretSlot::Closed;
            });
        }
    }

    sleep(shared.config.retention).await;
    shared.remove(token);
}

async fn run(
    shared: &Shared,
    token: HandshakeToken,
    owner: &OwnerKey,
    cancel: &CancellationToken,
) -> Result<(), FlowEnd> {
    let config = &shared.config;
    let LoginChannel { flow, mut consumed } = shared
        .retry
        .call(cancel, "begin_login", || {
            shared.connector.begin_login(&config.transport)
        })
        .await?;

    let identity = loop {
        let credential = shared
            .retry
            .call(cancel, "export_login_credential", || {
                flow.export_login_credential()
            })
            .await?;

        let uri = login_uri(&config.login_uri_scheme, &credential.token);
        let image = render_qr(&uri)
            .inspect_err(|e| warn!(error = %e, "could not render login code"))
            .ok();
        shared.update(token, |entry| entry.snapshot.show_credential(uri, image));

        let wait = (credential.expires_at - Utc::now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(config.fallback_credential_ttl);

        tokio::select! {
            signal = consumed.recv() => {
                if signal.is_none() {
                    return Err(FlowEnd::Failed("login channel closed".to_string()));
                }
            }
            _ = sleep(wait) => {
                debug!("login credential expired; minting a new one");
                continue;
            }
        }

        let imported = shared
            .retry
            .call(cancel, "import_login_credential", || {
                flow.import_login_credential(&credential.token)
            })
            .await?;
        match imported {
            LoginImport::Success(identity) => break identity,
            LoginImport::SecondFactorRequired => {
                break second_factor(shared, token, flow.as_ref(), cancel).await?;
            }
            LoginImport::Migrate { datacenter } => {
                warn!(datacenter, "login requires datacenter migration");
                return Err(FlowEnd::Failed(
                    "account migration required (not supported)".to_string(),
                ));
            }
        }
    };

    complete(shared, token, owner, flow.as_ref(), identity, cancel).await
}

/// Collect secrets until one is accepted, one round at a time.
async fn second_factor(
    shared: &Shared,
    token: HandshakeToken,
    flow: &dyn LoginFlow,
    cancel: &CancellationToken,
) -> Result<AccountIdentity, FlowEnd> {
    let timeout = shared.config.secret_timeout;
    let mut rejection: Option<String> = None;

    loop {
        let (tx, rx) = oneshot::channel::<SecretString>();
        let deadline = Instant::now() + timeout;
        let expires_at = after(timeout);
        let error = rejection.take();
        shared.update(token, |entry| {
            entry.snapshot.require_secret(expires_at, error);
            entry.secret = SecretSlot::Open(tx);
        });
        info!("second factor required");

        let challenge = shared
            .retry
            .call(cancel, "second_factor_challenge", || {
                flow.second_factor_challenge()
            })
            .await?;

        let secret = tokio::select! {
            received = rx => match received {
                Ok(secret) => secret,
                // The slot is only dropped when the session is removed.
                Err(_) => return Err(FlowEnd::Cancelled),
            },
            _ = sleep_until(deadline) => {
                return Err(FlowEnd::Expired("password input timed out".to_string()));
            }
        };

        let proof = flow.derive_proof(&challenge, &secret);
        drop(secret);
        let result = match proof {
            Ok(proof) => {
                shared
                    .retry
                    .call(cancel, "submit_second_factor_proof", || {
                        flow.submit_second_factor_proof(proof.clone())
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(identity) => return Ok(identity),
            Err(ProtocolError::InvalidSecondFactor) => {
                info!("second factor rejected");
                rejection = Some(ProtocolError::InvalidSecondFactor.to_string());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Store the exported session and the account, then publish `Success`.
async fn complete(
    shared: &Shared,
    token: HandshakeToken,
    owner: &OwnerKey,
    flow: &dyn LoginFlow,
    identity: AccountIdentity,
    cancel: &CancellationToken,
) -> Result<(), FlowEnd> {
    if cancel.is_cancelled() {
        return Err(FlowEnd::Cancelled);
    }
    let blob = shared
        .retry
        .call(cancel, "export_session", || flow.export_session())
        .await?;

    let account = Account::from_identity(owner.clone(), identity, Utc::now());
    shared
        .vault
        .store(&account.id, &blob)
        .map_err(|e| FlowEnd::Failed(e.to_string()))?;
    let account = shared
        .accounts
        .upsert(account)
        .map_err(|e| FlowEnd::Failed(e.to_string()))?;

    info!(account = %account.id, owner = %owner, "account linked");
    shared.update(token, |entry| {
        entry.snapshot.succeed(account);
        entry.secret = SecretSlot::Closed;
    });
    Ok(())
}
