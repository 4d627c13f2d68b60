use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::traits::{StageError, StageHandler};
use super::types::{DownloadResult, Story, local_path_for};
use crate::pool;
use crate::queue::{Job, JobOptions, JobPayload, JobSink, Stage};
use crate::worker::http::HttpClient;

/// Streams every story asset to `<root>/<username>/<filename>` and enqueues one upload job
pub struct DownloadHandler {
    http: Arc<HttpClient>,
    root: PathBuf,
    concurrency: usize,
    sink: Arc<dyn JobSink>,
    upload_options: JobOptions,
}

impl DownloadHandler {
    pub fn new(
        http: Arc<HttpClient>,
        root: impl Into<PathBuf>,
        concurrency: usize,
        sink: Arc<dyn JobSink>,
        upload_options: JobOptions,
    ) -> Self {
        Self {
            http,
            root: root.into(),
            concurrency,
            sink,
            upload_options,
        }
    }

    /// Users one after another; the assets of each user through the pool
    pub async fn download_all(&self, stories: &[Story]) -> Result<Vec<DownloadResult>, StageError> {
        let mut results = Vec::new();
        for story in stories {
            results.extend(self.download_story(story).await?);
        }
        Ok(results)
    }

    async fn download_story(&self, story: &Story) -> Result<Vec<DownloadResult>, StageError> {
        let targets = story
            .assets()
            .map(|asset| Ok((asset.url.clone(), local_path_for(&self.root, &story.username, asset)?)))
            .collect::<Result<Vec<_>, StageError>>()?;
        let targets = last_per_path(targets);

        if targets.is_empty() {
            return Ok(Vec::new());
        }
        info!(username = %story.username, assets = targets.len(), "Downloading story assets");

        pool::run(targets, self.concurrency, |(url, path)| {
            let http = self.http.clone();
            let username = story.username.clone();
            async move {
                http.download_to(&url, &path).await?;
                Ok::<_, StageError>(DownloadResult { path, username })
            }
        })
        .await
    }
}

/// Keep only the last asset mapped to each path, so no two tasks write one file
fn last_per_path(targets: Vec<(String, PathBuf)>) -> Vec<(String, PathBuf)> {
    let mut seen = HashSet::new();
    let mut unique: Vec<_> = targets
        .into_iter()
        .rev()
        .filter(|(url, path)| {
            let first = seen.insert(path.clone());
            if !first {
                warn!(url = %url, path = %path.display(), "Asset shares its file name with a later one, skipping");
            }
            first
        })
        .collect();
    unique.reverse();
    unique
}

#[async_trait]
impl StageHandler for DownloadHandler {
    async fn handle(&self, job: &Job) -> Result<(), StageError> {
        let JobPayload::Download { stories } = &job.payload else {
            return Err(StageError::UnexpectedPayload(Stage::Download));
        };

        let results = self.download_all(stories).await?;
        if results.is_empty() {
            info!("Nothing downloaded, no upload needed");
            return Ok(());
        }

        let mut seen = HashSet::new();
        let paths: Vec<PathBuf> = results
            .into_iter()
            .map(|result| result.path)
            .filter(|path| seen.insert(path.clone()))
            .collect();
        let files = paths.len();
        let next = self
            .sink
            .enqueue(JobPayload::Upload { paths }, self.upload_options.clone())
            .await?;

        info!(upload_job = next.id, files, "Upload job enqueued");
        Ok(())
    }
}
