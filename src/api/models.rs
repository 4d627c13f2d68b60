//! Response and query types of the operator API.
//!
//! Jobs are returned as stored by the broker (see [`crate::queue::Job`]):
//!
//! ```json
//! {
//!   "id": 12,
//!   "stage": "download",
//!   "payload": {"kind": "download", "stories": [...]},
//!   "status": "waiting",
//!   "attempts_made": 1,
//!   "max_attempts": 3,
//!   "timeout_ms": 1800000,
//!   "available_at_ms": 1700000005000,
//!   "created_at_ms": 1700000000000,
//!   "failed_reason": "network error: HTTP 503 for https://..."
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::observability::MetricsSnapshot;
use crate::queue::{Job, JobId, StatusCounts};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

/// `GET /api/jobs?status=&limit=`
#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RepeatSummary {
    pub key: String,
    pub cron: String,
    pub timezone: String,
    pub pending_job: Option<JobId>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub counts: StatusCounts,
    pub metrics: MetricsSnapshot,
    pub repeats: Vec<RepeatSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub job_id: JobId,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
}
