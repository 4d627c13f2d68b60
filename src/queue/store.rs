use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use super::job::{Job, JobId, JobStatus, Stage};
use super::repeat::RepeatDefinition;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: id={0}")]
    JobNotFound(JobId),

    #[error("Invalid key in partition '{0}'")]
    InvalidKey(&'static str),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Per-status job counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// JobStore persists jobs, the waiting index and repeat definitions in Fjall
///
/// Partitions:
/// - `jobs`: u64 id (big-endian) → Job (JSON)
/// - `waiting`: stage tag | available_at (big-endian) | id → empty
/// - `repeats`: repeat key → RepeatDefinition (JSON)
/// - `metadata`: "next_seq" → u64
///
/// The waiting index is ordered by availability time within a stage, so the
/// first key under a stage prefix is always the next job due.
pub struct JobStore {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    waiting: PartitionHandle,
    repeats: PartitionHandle,
    metadata: PartitionHandle,
    seq_counter: AtomicU64,
}

impl JobStore {
    /// Open or create a JobStore at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening JobStore at: {}", path.as_ref().display());

        let keyspace = Config::new(path).open()?;

        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let waiting = keyspace.open_partition("waiting", PartitionCreateOptions::default())?;
        let repeats = keyspace.open_partition("repeats", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        let current_seq = match metadata.get(b"next_seq")? {
            Some(bytes) => decode_u64(&bytes).ok_or(QueueError::InvalidKey("metadata"))?,
            None => 0,
        };

        info!("JobStore opened, current sequence: {}", current_seq);

        Ok(Self {
            keyspace,
            jobs,
            waiting,
            repeats,
            metadata,
            seq_counter: AtomicU64::new(current_seq),
        })
    }

    /// Reserve the next job id and persist the counter
    pub fn next_id(&self) -> Result<JobId> {
        let id = self.seq_counter.fetch_add(1, Ordering::SeqCst);
        self.metadata.insert(b"next_seq", (id + 1).to_be_bytes())?;
        Ok(id)
    }

    /// Write a job, keeping the waiting index in step with its status
    ///
    /// `previous` is the stored version being replaced, if any.
    pub fn put(&self, job: &Job, previous: Option<&Job>) -> Result<()> {
        let mut batch = self.keyspace.batch();
        self.stage_job(&mut batch, job, previous)?;
        batch.commit()?;

        debug!(job_id = job.id, stage = %job.stage, status = %job.status, "Job stored");
        Ok(())
    }

    /// Write a repeat instance together with its definition
    ///
    /// `previous` is the stored version of the instance when it is being rewritten.
    pub fn put_repeat_instance(
        &self,
        job: &Job,
        previous: Option<&Job>,
        definition: &RepeatDefinition,
    ) -> Result<()> {
        let mut batch = self.keyspace.batch();
        self.stage_job(&mut batch, job, previous)?;
        batch.insert(
            &self.repeats,
            definition.spec.key.as_bytes(),
            serde_json::to_vec(definition)?,
        );
        batch.commit()?;

        debug!(job_id = job.id, key = %definition.spec.key, "Repeat instance stored");
        Ok(())
    }

    fn stage_job(&self, batch: &mut Batch, job: &Job, previous: Option<&Job>) -> Result<()> {
        if let Some(prev) = previous.filter(|p| p.status == JobStatus::Waiting) {
            batch.remove(&self.waiting, waiting_key(prev));
        }
        if job.status == JobStatus::Waiting {
            batch.insert(&self.waiting, waiting_key(job), Vec::<u8>::new());
        }
        batch.insert(&self.jobs, job.id.to_be_bytes(), serde_json::to_vec(job)?);
        Ok(())
    }

    /// Retrieve a job by id
    pub fn get(&self, id: JobId) -> Result<Option<Job>> {
        match self.jobs.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete a job and its index entry
    pub fn remove(&self, job: &Job) -> Result<()> {
        let mut batch = self.keyspace.batch();
        if job.status == JobStatus::Waiting {
            batch.remove(&self.waiting, waiting_key(job));
        }
        batch.remove(&self.jobs, job.id.to_be_bytes());
        batch.commit()?;
        Ok(())
    }

    /// Earliest waiting job of `stage`, with its availability time
    pub fn first_waiting(&self, stage: Stage) -> Result<Option<(JobId, i64)>> {
        match self.waiting.prefix([stage.tag()]).next() {
            Some(item) => {
                let (key, _) = item?;
                parse_waiting_key(&key).map(Some)
            }
            None => Ok(None),
        }
    }

    /// List jobs, newest first, optionally filtered by status
    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for item in self.jobs.iter().rev() {
            if jobs.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let job: Job = serde_json::from_slice(&value)?;
            if status.is_none_or(|s| s == job.status) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.list(Some(status), usize::MAX)
    }

    pub fn counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for item in self.jobs.iter() {
            let (_, value) = item?;
            let job: Job = serde_json::from_slice(&value)?;
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    pub fn get_repeat(&self, key: &str) -> Result<Option<RepeatDefinition>> {
        match self.repeats.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_repeat(&self, definition: &RepeatDefinition) -> Result<()> {
        self.repeats
            .insert(definition.spec.key.as_bytes(), serde_json::to_vec(definition)?)?;
        Ok(())
    }

    pub fn repeats(&self) -> Result<BTreeMap<String, RepeatDefinition>> {
        let mut defs = BTreeMap::new();
        for item in self.repeats.iter() {
            let (_, value) = item?;
            let def: RepeatDefinition = serde_json::from_slice(&value)?;
            defs.insert(def.spec.key.clone(), def);
        }
        Ok(defs)
    }

    /// Get current sequence counter value
    pub fn current_seq(&self) -> u64 {
        self.seq_counter.load(Ordering::SeqCst)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}

fn waiting_key(job: &Job) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(job.stage.tag());
    key.extend_from_slice(&(job.available_at_ms.max(0) as u64).to_be_bytes());
    key.extend_from_slice(&job.id.to_be_bytes());
    key
}

fn parse_waiting_key(key: &[u8]) -> Result<(JobId, i64)> {
    if key.len() != 17 {
        return Err(QueueError::InvalidKey("waiting"));
    }
    let available_at = decode_u64(&key[1..9]).ok_or(QueueError::InvalidKey("waiting"))?;
    let id = decode_u64(&key[9..17]).ok_or(QueueError::InvalidKey("waiting"))?;
    Ok((id, available_at as i64))
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}
