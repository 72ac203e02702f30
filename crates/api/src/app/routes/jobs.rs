use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use outreach_core::ResourceKey;
use outreach_infra::jobs::{JobId, JobPayload};
use outreach_protocol::TransportConfig;

use crate::app::dto::{CreateJobRequest, JobAccepted, JobView};
use crate::app::errors;
use crate::app::services::AppServices;

fn parse_resource(raw: &str) -> Result<ResourceKey, axum::response::Response> {
    ResourceKey::parse(raw).map_err(|e| errors::bad_request(e.to_string()))
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|_| errors::bad_request(format!("invalid job id: {raw}")))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(resource): Path<String>,
    Json(body): Json<CreateJobRequest>,
) -> axum::response::Response {
    let resource = match parse_resource(&resource) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let engine = &services.engine;
    if engine.accounts.get(&resource).is_none() {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("account {resource} not found"),
        );
    }

    let transport = match body.proxy_url {
        Some(url) if !url.trim().is_empty() => TransportConfig::with_proxy(url.trim()),
        _ => engine.config.transport.clone(),
    };
    let kind = body.params.kind();
    let payload = JobPayload {
        session: engine.vault.reference_for(&resource),
        transport,
        params: body.params,
    };

    match engine.jobs.start_job(resource, kind, payload).await {
        Ok((job, is_new)) => {
            (StatusCode::ACCEPTED, Json(JobAccepted::new(&job, is_new))).into_response()
        }
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(resource): Path<String>,
) -> axum::response::Response {
    let resource = match parse_resource(&resource) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let jobs: Vec<JobView> = services
        .engine
        .jobs
        .get_jobs_by_resource(&resource)
        .into_iter()
        .map(JobView::from)
        .collect();
    Json(serde_json::json!({ "jobs": jobs })).into_response()
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.engine.jobs.get_job(id) {
        Some(job) => Json(JobView::from(job)).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
    }
}

pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.engine.jobs.retry_failed(id).await {
        Ok((job, is_new)) => {
            (StatusCode::ACCEPTED, Json(JobAccepted::new(&job, is_new))).into_response()
        }
        Err(e) => errors::job_error_to_response(e),
    }
}
