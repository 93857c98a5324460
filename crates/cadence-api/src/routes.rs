//! API routes for the job queue and dead-letter queue

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use cadence_queue::{
    DeadLetterPage, DeadLetterQuery, DlqStats, Job, JobId, NewJob, PurgeReport, PurgeRequest,
    RequeueReport, WorkerStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::OpenApi;

use crate::error::{ApiError, ApiResponse, ApiResult};
use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub store: String,
    pub workers_running: bool,
}

/// Liveness plus store connectivity
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_healthy = state.leases().backend().is_healthy().await;

    Json(HealthResponse {
        status: if store_healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        store: if store_healthy { "healthy" } else { "unhealthy" }.to_string(),
        workers_running: state.orchestrator().is_running().await,
    })
}

/// Per-worker status, including the lease reaper
#[utoipa::path(
    get,
    path = "/health/workers",
    responses(
        (status = 200, description = "Map of worker name to WorkerStatus")
    )
)]
pub async fn worker_health(State(state): State<AppState>) -> ApiResult<BTreeMap<String, WorkerStatus>> {
    Ok(ApiResponse::success(state.orchestrator().status().await))
}

/// Job submission request
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateJobRequest {
    pub kind: String,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Delay before the job becomes visible to workers
    #[serde(default)]
    pub delay_secs: Option<u64>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CreateJobResponse {
    pub id: String,
}

/// Enqueue a job
#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 201, description = "Job enqueued (or existing job with the same idempotency key)", body = CreateJobResponse),
        (status = 422, description = "Unknown kind or invalid payload")
    )
)]
pub async fn create_job(
    State(state): State<AppState>,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<(StatusCode, ApiResponse<CreateJobResponse>), ApiError> {
    let Json(req) = body?;

    let mut job = NewJob::new(req.kind, req.payload).priority(req.priority);
    if let Some(key) = req.idempotency_key {
        job = job.idempotency_key(key);
    }
    if let Some(delay) = req.delay_secs {
        let visible_at = i64::try_from(delay)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| ApiError::Validation("delay_secs out of range".into()))?;
        job = job.visible_at(visible_at);
    }

    let id = state.leases().enqueue(job).await?;
    Ok((
        StatusCode::CREATED,
        ApiResponse::success(CreateJobResponse { id: id.to_string() }),
    ))
}

/// Fetch a job by id
#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    params(("id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job row", body = Job),
        (status = 404, description = "No such job")
    )
)]
pub async fn get_job(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
) -> ApiResult<Job> {
    let Path(raw) = id?;
    let not_found = || ApiError::NotFound(format!("job {} not found", raw));

    let id: JobId = raw.trim().parse().map_err(|_| not_found())?;
    let job = state.leases().get_job(id).await?.ok_or_else(not_found)?;
    Ok(ApiResponse::success(job))
}

/// List dead-lettered jobs
#[utoipa::path(
    get,
    path = "/dlq",
    params(DeadLetterQuery),
    responses(
        (status = 200, description = "One page of dead-letter entries", body = DeadLetterPage),
        (status = 422, description = "Invalid paging or range")
    )
)]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    query: Result<Query<DeadLetterQuery>, QueryRejection>,
) -> ApiResult<DeadLetterPage> {
    let Query(query) = query?;
    Ok(ApiResponse::success(state.dlq().list(&query).await?))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RequeueRequest {
    pub ids: Vec<String>,
}

/// Move dead-lettered jobs back to pending
#[utoipa::path(
    post,
    path = "/dlq/requeue",
    request_body = RequeueRequest,
    responses(
        (status = 200, description = "Per-id requeue outcome", body = RequeueReport),
        (status = 422, description = "Empty or oversized id list")
    )
)]
pub async fn requeue_dead_letters(
    State(state): State<AppState>,
    body: Result<Json<RequeueRequest>, JsonRejection>,
) -> ApiResult<RequeueReport> {
    let Json(req) = body?;
    Ok(ApiResponse::success(state.dlq().requeue(&req.ids).await?))
}

/// Delete dead-lettered jobs by id or by age
#[utoipa::path(
    post,
    path = "/dlq/purge",
    request_body = PurgeRequest,
    responses(
        (status = 200, description = "Number of rows deleted", body = PurgeReport),
        (status = 422, description = "Neither or both of ids / older_than given")
    )
)]
pub async fn purge_dead_letters(
    State(state): State<AppState>,
    body: Result<Json<PurgeRequest>, JsonRejection>,
) -> ApiResult<PurgeReport> {
    let Json(req) = body?;
    Ok(ApiResponse::success(state.dlq().purge(&req).await?))
}

/// Dead-letter counts by reason
#[utoipa::path(
    get,
    path = "/dlq/stats",
    responses(
        (status = 200, description = "Aggregate dead-letter statistics", body = DlqStats)
    )
)]
pub async fn dead_letter_stats(State(state): State<AppState>) -> ApiResult<DlqStats> {
    Ok(ApiResponse::success(state.dlq().stats().await?))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        worker_health,
        create_job,
        get_job,
        list_dead_letters,
        requeue_dead_letters,
        purge_dead_letters,
        dead_letter_stats,
    ),
    components(
        schemas(
            HealthResponse,
            CreateJobRequest, CreateJobResponse,
            RequeueRequest,
            crate::error::ErrorBody,
            cadence_queue::Job,
            cadence_queue::JobStatus,
            cadence_queue::WorkerStatus,
            cadence_queue::DeadLetterEntry,
            cadence_queue::DeadLetterPage,
            cadence_queue::OrderBy,
            cadence_queue::OrderDir,
            cadence_queue::RequeueReport,
            cadence_queue::SkippedId,
            cadence_queue::PurgeRequest,
            cadence_queue::PurgeReport,
            cadence_queue::DlqStats,
        )
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Build the API router
pub fn api_router(state: AppState) -> Router {
    Router::new()
        // Documentation
        .route("/api-docs/openapi.json", get(openapi_json))
        // Health
        .route("/health", get(health))
        .route("/health/workers", get(worker_health))
        // Jobs
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/{id}", get(get_job))
        // Dead-letter queue
        .route("/dlq", get(list_dead_letters))
        .route("/dlq/requeue", post(requeue_dead_letters))
        .route("/dlq/purge", post(purge_dead_letters))
        .route("/dlq/stats", get(dead_letter_stats))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_dlq_paths() {
        let doc = ApiDoc::openapi();
        for path in ["/dlq", "/dlq/requeue", "/dlq/purge", "/dlq/stats", "/api/v1/jobs/{id}"] {
            assert!(doc.paths.paths.contains_key(path), "missing {}", path);
        }
    }

    #[test]
    fn test_create_job_request_defaults() {
        let req: CreateJobRequest = serde_json::from_value(serde_json::json!({
            "kind": "watchlist",
            "payload": { "artist_id": 1 }
        }))
        .unwrap();
        assert_eq!(req.priority, 0);
        assert!(req.idempotency_key.is_none());
        assert!(req.delay_secs.is_none());
    }
}
