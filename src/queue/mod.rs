//! Durable job queue: job model, fjall-backed store, cron repeats and the broker

pub mod broker;
pub mod job;
pub mod repeat;
pub mod store;

pub use broker::{AttemptFailure, Broker, BrokerConfig, BrokerError, BrokerEvent, JobSink};
pub use job::{Job, JobId, JobLock, JobOptions, JobPayload, JobStatus, RepeatSpec, Stage};
pub use repeat::{CronSchedule, RepeatDefinition, ScheduleError};
pub use store::{JobStore, QueueError, StatusCounts};
