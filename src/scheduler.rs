//! Recurring fetch trigger

use std::time::Duration;

use tracing::info;

use crate::queue::{Broker, BrokerError, Job, JobOptions, JobPayload, RepeatSpec};

/// Repeat key of the standing fetch trigger
pub const FETCH_REPEAT_KEY: &str = "fetch-stories";

pub struct Scheduler {
    broker: Broker,
}

impl Scheduler {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Ensure exactly one standing fetch trigger exists for `cron` in `timezone`
    ///
    /// Safe to call on every start: an unchanged schedule keeps its pending
    /// run, a changed one replaces it.
    pub async fn schedule_fetch(
        &self,
        cron: &str,
        timezone: &str,
        max_attempts: u32,
        timeout: Duration,
    ) -> Result<Job, BrokerError> {
        let options = JobOptions::new(max_attempts, timeout).with_repeat(RepeatSpec {
            key: FETCH_REPEAT_KEY.to_string(),
            cron: cron.to_string(),
            timezone: timezone.to_string(),
        });

        let job = self.broker.enqueue(JobPayload::Fetch, options).await?;
        info!(
            job_id = job.id,
            cron,
            timezone,
            next_run = %format_ms(job.available_at_ms),
            "Fetch schedule active"
        );
        Ok(job)
    }

    /// One-off fetch outside the schedule
    pub async fn trigger_fetch(&self, max_attempts: u32, timeout: Duration) -> Result<Job, BrokerError> {
        let job = self
            .broker
            .enqueue(JobPayload::Fetch, JobOptions::new(max_attempts, timeout))
            .await?;
        info!(job_id = job.id, "Manual fetch triggered");
        Ok(job)
    }
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{BrokerConfig, JobStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_schedule_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::open(dir.path(), BrokerConfig::default()).unwrap();
        let scheduler = Scheduler::new(broker.clone());

        let first = scheduler
            .schedule_fetch("15 10 * * *", "America/Los_Angeles", 1, Duration::from_secs(30))
            .await
            .unwrap();
        let again = scheduler
            .schedule_fetch("15 10 * * *", "America/Los_Angeles", 1, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(first.repeat.as_ref().unwrap().key, FETCH_REPEAT_KEY);
        assert_eq!(broker.list(Some(JobStatus::Waiting), 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_survives_restart() {
        let dir = TempDir::new().unwrap();
        let first = {
            let broker = Broker::open(dir.path(), BrokerConfig::default()).unwrap();
            let job = Scheduler::new(broker.clone())
                .schedule_fetch("15 10 * * *", "America/Los_Angeles", 1, Duration::from_secs(30))
                .await
                .unwrap();
            broker.shutdown().await.unwrap();
            job
        };

        let broker = Broker::open(dir.path(), BrokerConfig::default()).unwrap();
        let again = Scheduler::new(broker.clone())
            .schedule_fetch("15 10 * * *", "America/Los_Angeles", 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(broker.repeats().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_attempts_and_timeout_apply_to_schedule() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::open(dir.path(), BrokerConfig::default()).unwrap();
        let scheduler = Scheduler::new(broker.clone());

        let first = scheduler
            .schedule_fetch("15 10 * * *", "UTC", 1, Duration::from_secs(30))
            .await
            .unwrap();
        let again = scheduler
            .schedule_fetch("15 10 * * *", "UTC", 5, Duration::from_secs(600))
            .await
            .unwrap();

        // Same firing slot, new settings
        assert_eq!(again.id, first.id);
        assert_eq!(again.available_at_ms, first.available_at_ms);
        assert_eq!(again.max_attempts, 5);
        assert_eq!(again.timeout(), Duration::from_secs(600));

        let stored = broker.get(first.id).unwrap().unwrap();
        assert_eq!(stored.max_attempts, 5);
        assert_eq!(stored.timeout_ms, 600_000);

        let definition = &broker.repeats().unwrap()[FETCH_REPEAT_KEY];
        assert_eq!(definition.max_attempts, 5);
        assert_eq!(definition.timeout_ms, 600_000);
        assert_eq!(definition.pending, Some(first.id));
        assert_eq!(broker.list(Some(JobStatus::Waiting), 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_schedule_rejected() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::open(dir.path(), BrokerConfig::default()).unwrap();
        let err = Scheduler::new(broker)
            .schedule_fetch("61 10 * * *", "UTC", 1, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Schedule(_)));
    }

    #[tokio::test]
    async fn test_trigger_is_immediate() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::open(dir.path(), BrokerConfig::default()).unwrap();
        let job = Scheduler::new(broker).trigger_fetch(1, Duration::from_secs(30)).await.unwrap();
        assert!(job.repeat.is_none());
        assert!(job.available_at_ms <= crate::queue::job::now_ms());
    }
}
