use axum::{
    routing::{get, post},
    Router,
};

pub mod handshakes;
pub mod jobs;
pub mod system;

/// Router for the job and handshake endpoints.
pub fn router() -> Router {
    Router::new()
        .route(
            "/accounts/:resource/jobs",
            post(jobs::create_job).get(jobs::list_jobs),
        )
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/retry", post(jobs::retry_job))
        .route("/handshakes", post(handshakes::start_handshake))
        .route(
            "/handshakes/:token",
            get(handshakes::get_handshake).delete(handshakes::cancel_handshake),
        )
        .route("/handshakes/:token/secret", post(handshakes::submit_secret))
}
