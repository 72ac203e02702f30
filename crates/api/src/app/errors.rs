use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use outreach_infra::handshake::HandshakeError;
use outreach_infra::jobs::{JobError, JobStoreError};

pub fn job_error_to_response(err: JobError) -> axum::response::Response {
    match err {
        JobError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        JobError::NothingToRetry => json_error(StatusCode::CONFLICT, "nothing_to_retry", "nothing to retry"),
        JobError::StillActive(_) => json_error(StatusCode::CONFLICT, "job_active", err.to_string()),
        JobError::RetryUnsupported(_) => {
            json_error(StatusCode::BAD_REQUEST, "retry_unsupported", err.to_string())
        }
        JobError::Invalid(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        JobError::Store(JobStoreError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        JobError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
        JobError::NoRunner(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "no_runner", err.to_string()),
    }
}

pub fn handshake_error_to_response(err: HandshakeError) -> axum::response::Response {
    match err {
        HandshakeError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        HandshakeError::NotAwaitingSecret | HandshakeError::SecretPending => {
            json_error(StatusCode::CONFLICT, "invalid_state", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn bad_request(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", message)
}
