use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::traits::{StageError, StageHandler};
use super::types::remote_path_for;
use crate::queue::{Job, JobPayload, Stage};
use crate::storage::StorageClient;

/// Copies downloaded files into blob storage under `username/filename`
pub struct UploadHandler {
    storage: Option<Arc<StorageClient>>,
    concurrency: usize,
}

impl UploadHandler {
    /// `storage` is `None` when no connection string is configured; every job then fails
    pub fn new(storage: Option<Arc<StorageClient>>, concurrency: usize) -> Self {
        Self { storage, concurrency }
    }
}

#[async_trait]
impl StageHandler for UploadHandler {
    async fn handle(&self, job: &Job) -> Result<(), StageError> {
        let JobPayload::Upload { paths } = &job.payload else {
            return Err(StageError::UnexpectedPayload(Stage::Upload));
        };
        let storage = self.storage.as_ref().ok_or_else(|| {
            StageError::Configuration("storage connection string is not set".to_string())
        })?;

        if paths.is_empty() {
            return Ok(());
        }

        let receipts = storage
            .upload_files(paths.clone(), self.concurrency, remote_path_for)
            .await?;

        let bytes: u64 = receipts.iter().map(|receipt| receipt.size).sum();
        info!(
            container = %storage.container,
            files = receipts.len(),
            bytes,
            "Upload finished"
        );
        Ok(())
    }
}
