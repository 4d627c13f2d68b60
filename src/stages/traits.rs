use async_trait::async_trait;
use thiserror::Error;

use crate::instagram::AuthError;
use crate::queue::{BrokerError, Job, Stage};
use crate::storage::StorageError;
use crate::worker::http::DownloadError;

/// Stage handler errors
///
/// Every variant counts as one failed attempt of the whole job; the broker
/// decides whether the job is retried or failed for good.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected payload for {0} stage")]
    UnexpectedPayload(Stage),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("enqueue failed: {0}")]
    Enqueue(#[from] BrokerError),
}

impl From<AuthError> for StageError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredentials | AuthError::Rejected(_) => {
                StageError::Authentication(err.to_string())
            }
            AuthError::Request(_) | AuthError::Decode(_) => StageError::Network(err.to_string()),
        }
    }
}

impl From<DownloadError> for StageError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::Io(io) => StageError::Io(io),
            other => StageError::Network(other.to_string()),
        }
    }
}

impl From<StorageError> for StageError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UnmappedPath(_) => StageError::Validation(err.to_string()),
            StorageError::InvalidConnectionString(_) => StageError::Configuration(err.to_string()),
            StorageError::Io(io) => StageError::Io(io),
            other => StageError::Network(other.to_string()),
        }
    }
}

/// Handler registered with the broker for one stage
///
/// Handlers receive the claimed job, perform their I/O and enqueue the next
/// stage's job themselves. They never retry internally.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), StageError>;
}
