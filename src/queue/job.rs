//! Job model persisted by the broker

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stages::types::Story;

pub type JobId = u64;

/// Named pipeline stage; each stage has its own queue and handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Download,
    Upload,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Fetch, Stage::Download, Stage::Upload];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Download => "download",
            Stage::Upload => "upload",
        }
    }

    /// Single-byte prefix used by the waiting index
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Stage::Fetch => 0,
            Stage::Download => 1,
            Stage::Upload => 2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Stage-specific job input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobPayload {
    /// Cron trigger; carries no data
    Fetch,
    Download { stories: Vec<Story> },
    Upload { paths: Vec<PathBuf> },
}

impl JobPayload {
    pub fn stage(&self) -> Stage {
        match self {
            JobPayload::Fetch => Stage::Fetch,
            JobPayload::Download { .. } => Stage::Download,
            JobPayload::Upload { .. } => Stage::Upload,
        }
    }
}

/// Recurring schedule attached to a job
///
/// `key` identifies the standing definition, so registering the same key
/// twice never produces two triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatSpec {
    pub key: String,
    pub cron: String,
    pub timezone: String,
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub repeat: Option<RepeatSpec>,
}

impl JobOptions {
    pub fn new(max_attempts: u32, timeout: Duration) -> Self {
        Self {
            max_attempts,
            timeout,
            repeat: None,
        }
    }

    pub fn with_repeat(mut self, repeat: RepeatSpec) -> Self {
        self.repeat = Some(repeat);
        self
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::new(1, Duration::from_secs(30))
    }
}

/// Ownership record of an Active job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub token: Uuid,
    pub worker: String,
    pub acquired_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub stage: Stage,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatSpec>,
    /// Earliest time a worker may claim the job
    pub available_at_ms: i64,
    pub created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<JobLock>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        payload: JobPayload,
        options: &JobOptions,
        available_at_ms: i64,
    ) -> Self {
        Self {
            id,
            stage: payload.stage(),
            payload,
            status: JobStatus::Waiting,
            attempts_made: 0,
            max_attempts: options.max_attempts.max(1),
            timeout_ms: options.timeout.as_millis().min(u64::MAX as u128) as u64,
            repeat: options.repeat.clone(),
            available_at_ms,
            created_at_ms: now_ms(),
            finished_at_ms: None,
            failed_reason: None,
            lock: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
