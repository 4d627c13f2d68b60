use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::{
    error::ApiError,
    models::{
        DEFAULT_LIST_LIMIT, HealthResponse, JobListResponse, JobsQuery, MAX_LIST_LIMIT, RepeatSummary,
        StatsResponse, TriggerResponse,
    },
    state::AppState,
};
use crate::queue::{JobId, JobStatus};

/// Job listing (GET /api/jobs)
///
/// Newest first. `status` filters by lifecycle state, `limit` defaults to 50
/// and is capped at 500.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(ApiError::InvalidQuery)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    let jobs = state.broker.list(status, limit)?;
    let count = jobs.len();
    Ok(Json(JobListResponse { jobs, count }))
}

/// Single job (GET /api/jobs/{id})
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .broker
        .get(job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;

    Ok((StatusCode::OK, Json(job)))
}

/// Queue counts, broker counters and repeat schedules (GET /api/stats)
pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let counts = state.broker.counts()?;
    let repeats = state
        .broker
        .repeats()?
        .into_values()
        .map(|definition| RepeatSummary {
            key: definition.spec.key,
            cron: definition.spec.cron,
            timezone: definition.spec.timezone,
            pending_job: definition.pending,
        })
        .collect();

    Ok(Json(StatsResponse {
        counts,
        metrics: state.broker.metrics().snapshot(),
        repeats,
    }))
}

/// One-off fetch outside the schedule (POST /api/trigger/fetch)
pub async fn trigger_fetch(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let policy = &state.fetch_policy;
    let job = state
        .scheduler
        .trigger_fetch(policy.max_attempts, policy.timeout())
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            job_id: job.id,
            status: job.status.to_string(),
        }),
    ))
}

/// Health check endpoint (GET /health)
///
/// Returns 503 Service Unavailable when the job store cannot be read.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = HashMap::new();
    components.insert("api".to_string(), "healthy".to_string());

    let store = match state.broker.counts() {
        Ok(_) => "healthy".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Job store health check failed");
            "unhealthy".to_string()
        }
    };
    components.insert("job_store".to_string(), store);

    let all_healthy = components.values().all(|status| status == "healthy");
    let (status_code, overall_status) = if all_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    let response = HealthResponse {
        status: overall_status.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}
