use super::models::{Config, StagePolicy};
use crate::queue::{CronSchedule, ScheduleError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    #[error("stages.{stage}.max_attempts must be at least 1")]
    InvalidMaxAttempts { stage: &'static str },

    #[error("stages.{stage}.timeout_secs must be at least 1")]
    InvalidTimeout { stage: &'static str },

    #[error("stages.{stage}.concurrency must be at least 1")]
    InvalidConcurrency { stage: &'static str },

    #[error("broker.worker_slots must be at least 1")]
    InvalidWorkerSlots,

    #[error("broker.poll_interval_ms must be at least 1")]
    InvalidPollInterval,

    #[error("storage.container must not be empty")]
    EmptyContainer,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_schedule(config)?;
    validate_stage("fetch", &config.stages.fetch)?;
    validate_stage("download", &config.stages.download)?;
    validate_stage("upload", &config.stages.upload)?;
    validate_broker(config)?;

    if config.storage.container.trim().is_empty() {
        return Err(ValidationError::EmptyContainer);
    }
    Ok(())
}

/// The cron expression and timezone must parse even when the schedule is disabled
fn validate_schedule(config: &Config) -> Result<(), ValidationError> {
    CronSchedule::parse(&config.schedule.cron, &config.schedule.timezone)?;
    Ok(())
}

fn validate_stage(stage: &'static str, policy: &StagePolicy) -> Result<(), ValidationError> {
    if policy.max_attempts == 0 {
        return Err(ValidationError::InvalidMaxAttempts { stage });
    }
    if policy.timeout_secs == 0 {
        return Err(ValidationError::InvalidTimeout { stage });
    }
    if policy.concurrency == 0 {
        return Err(ValidationError::InvalidConcurrency { stage });
    }
    Ok(())
}

fn validate_broker(config: &Config) -> Result<(), ValidationError> {
    if config.broker.worker_slots == 0 {
        return Err(ValidationError::InvalidWorkerSlots);
    }
    if config.broker.poll_interval_ms == 0 {
        return Err(ValidationError::InvalidPollInterval);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_bad_cron_and_timezone() {
        let mut config = Config::default();
        config.schedule.cron = "every day".into();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidSchedule(ScheduleError::InvalidCron { .. }))
        ));

        let mut config = Config::default();
        config.schedule.timezone = "Pacific/Nowhere".into();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidSchedule(ScheduleError::InvalidTimezone(_)))
        ));
    }

    #[test]
    fn test_stage_bounds() {
        let mut config = Config::default();
        config.stages.download.max_attempts = 0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidMaxAttempts { stage: "download" })
        ));

        let mut config = Config::default();
        config.stages.upload.concurrency = 0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidConcurrency { stage: "upload" })
        ));

        let mut config = Config::default();
        config.stages.fetch.timeout_secs = 0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidTimeout { stage: "fetch" })
        ));
    }

    #[test]
    fn test_broker_and_storage_bounds() {
        let mut config = Config::default();
        config.broker.worker_slots = 0;
        assert!(matches!(validate(&config), Err(ValidationError::InvalidWorkerSlots)));

        let mut config = Config::default();
        config.storage.container = " ".into();
        assert!(matches!(validate(&config), Err(ValidationError::EmptyContainer)));
    }
}
