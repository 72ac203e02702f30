use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use secrecy::SecretString;

use outreach_core::{HandshakeToken, OwnerKey};

use crate::app::dto::{StartHandshakeRequest, SubmitSecretRequest};
use crate::app::errors;
use crate::app::services::AppServices;

fn parse_token(raw: &str) -> Result<HandshakeToken, axum::response::Response> {
    raw.parse::<HandshakeToken>()
        .map_err(|_| errors::bad_request(format!("invalid handshake token: {raw}")))
}

pub async fn start_handshake(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<StartHandshakeRequest>,
) -> axum::response::Response {
    let owner = match OwnerKey::parse(&body.owner) {
        Ok(owner) => owner,
        Err(e) => return errors::bad_request(e.to_string()),
    };
    let snapshot = services.engine.handshakes.start(owner).await;
    (StatusCode::CREATED, Json(snapshot)).into_response()
}

pub async fn get_handshake(
    Extension(services): Extension<Arc<AppServices>>,
    Path(token): Path<String>,
) -> axum::response::Response {
    let token = match parse_token(&token) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match services.engine.handshakes.status(token) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => errors::handshake_error_to_response(e),
    }
}

pub async fn submit_secret(
    Extension(services): Extension<Arc<AppServices>>,
    Path(token): Path<String>,
    Json(body): Json<SubmitSecretRequest>,
) -> axum::response::Response {
    let token = match parse_token(&token) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match services
        .engine
        .handshakes
        .submit_secret(token, SecretString::from(body.secret))
    {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted" })),
        )
            .into_response(),
        Err(e) => errors::handshake_error_to_response(e),
    }
}

pub async fn cancel_handshake(
    Extension(services): Extension<Arc<AppServices>>,
    Path(token): Path<String>,
) -> axum::response::Response {
    let token = match parse_token(&token) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match services.engine.handshakes.cancel(token) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::handshake_error_to_response(e),
    }
}
