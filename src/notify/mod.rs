//! Failure alerts for jobs that exhausted their attempts

mod webhook;

pub use webhook::WebhookNotifier;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::{BrokerEvent, Job};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification token is not configured")]
    MissingToken,

    #[error("notification request failed: {0}")]
    Request(String),
}

/// Outbound alert channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

pub fn format_failure(job: &Job, error: &str) -> String {
    let plural = if job.attempts_made == 1 { "" } else { "s" };
    format!(
        "Job \"{}\" #{} failed after {} attempt{}: {}",
        job.stage, job.id, job.attempts_made, plural, error
    )
}

/// Forwards broker `Failed` events to a [`Notifier`]
pub struct FailureNotifier;

impl FailureNotifier {
    /// Consume `events` until the broker drops its sender
    ///
    /// Delivery errors and a lagging receiver are logged; neither stops the task.
    pub fn spawn(mut events: broadcast::Receiver<BrokerEvent>, notifier: Arc<dyn Notifier>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BrokerEvent::Failed { job, error }) => {
                        let message = format_failure(&job, &error);
                        match notifier.notify(&message).await {
                            Ok(()) => info!(job_id = job.id, stage = %job.stage, "Failure notification sent"),
                            Err(e) => warn!(job_id = job.id, error = %e, "Failure notification not delivered"),
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        error!(skipped, "Failure notifier lagged behind broker events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Failure notifier stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobOptions, JobPayload};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        messages: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, message: &str) -> Result<(), NotifyError> {
            self.messages.lock().unwrap().push(message.to_string());
            if self.fail {
                Err(NotifyError::Request("offline".into()))
            } else {
                Ok(())
            }
        }
    }

    fn failed_job(attempts: u32) -> Job {
        let mut job = Job::new(17, JobPayload::Fetch, &JobOptions::new(3, Duration::from_secs(30)), 0);
        job.attempts_made = attempts;
        job
    }

    #[test]
    fn test_format_failure() {
        assert_eq!(
            format_failure(&failed_job(3), "network error: reset"),
            "Job \"fetch\" #17 failed after 3 attempts: network error: reset"
        );
        assert_eq!(
            format_failure(&failed_job(1), "boom"),
            "Job \"fetch\" #17 failed after 1 attempt: boom"
        );
    }

    #[tokio::test]
    async fn test_only_failed_events_are_delivered() {
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(Recorder { messages: Mutex::new(Vec::new()), fail: true });
        let task = FailureNotifier::spawn(rx, recorder.clone());

        tx.send(BrokerEvent::Completed { job: failed_job(0) }).unwrap();
        tx.send(BrokerEvent::Retrying {
            job: failed_job(1),
            error: "x".into(),
            delay: Duration::from_secs(5),
        })
        .unwrap();
        tx.send(BrokerEvent::Failed { job: failed_job(3), error: "first".into() }).unwrap();
        // Delivery errors do not stop the notifier
        tx.send(BrokerEvent::Failed { job: failed_job(3), error: "second".into() }).unwrap();
        drop(tx);

        task.await.unwrap();
        let messages = recorder.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].ends_with("first"));
        assert!(messages[1].ends_with("second"));
    }
}
