//! Pipeline runtime - opens the broker and registers every stage

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::http::{DownloadError, HttpClient};
use crate::config::Config;
use crate::instagram::{AuthError, Credentials, InstagramClient, InstagramConfig, SessionStore, StorySource};
use crate::notify::{FailureNotifier, Notifier, NotifyError, WebhookNotifier};
use crate::queue::{Broker, BrokerError, JobSink, Stage};
use crate::scheduler::Scheduler;
use crate::stages::{DownloadHandler, FetchHandler, FetchSettings, UploadHandler, Whitelist};
use crate::storage::{StorageClient, StorageError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Storage setup failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Story source setup failed: {0}")]
    Source(#[from] AuthError),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] DownloadError),

    #[error("Notifier setup failed: {0}")]
    Notify(#[from] NotifyError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// External services the stages talk to
pub struct Collaborators {
    pub source: Arc<dyn StorySource>,
    pub http: Arc<HttpClient>,
    /// `None` when no connection string is configured
    pub storage: Option<Arc<StorageClient>>,
    /// `None` disables failure alerts
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Collaborators {
    /// Production collaborators; a malformed storage connection string is fatal here
    pub fn from_config(config: &Config) -> Result<Self> {
        let ig = &config.instagram;
        let credentials = match (&ig.username, &ig.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        let source = InstagramClient::new(InstagramConfig {
            api_base: ig.api_base.clone(),
            user_agent: ig.user_agent.clone(),
            request_timeout: Duration::from_secs(ig.request_timeout_secs),
            proxy: ig.proxy.clone(),
            credentials,
        })?;

        let http = HttpClient::new(config.download.http_config(), ig.proxy.as_deref())?;

        let storage = match &config.storage.connection_string {
            Some(connection) => Some(Arc::new(StorageClient::from_connection_string(
                connection,
                &config.storage.container,
            )?)),
            None => None,
        };

        let notifier: Option<Arc<dyn Notifier>> = if config.notify.enabled {
            Some(Arc::new(WebhookNotifier::new(
                config.notify.webhook_base.clone(),
                config.notify.channel.clone(),
                config.notify.token.clone(),
                Duration::from_secs(config.notify.timeout_secs),
            )?))
        } else {
            None
        };

        Ok(Self {
            source: Arc::new(source),
            http: Arc::new(http),
            storage,
            notifier,
        })
    }
}

/// Running fetch → download → upload pipeline
pub struct Pipeline {
    broker: Broker,
    notifier: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Open the job store from config and start the pipeline on it
    pub async fn start(config: &Config, collaborators: Collaborators) -> Result<Self> {
        info!(path = %config.broker.path.display(), "Opening job store");
        let broker = Broker::open(&config.broker.path, config.broker.broker_config())?;
        Self::start_with_broker(broker, config, collaborators).await
    }

    /// Register all stage handlers, the failure notifier and the fetch schedule
    pub async fn start_with_broker(broker: Broker, config: &Config, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            source,
            http,
            storage,
            notifier,
        } = collaborators;

        let notifier = match notifier {
            Some(notifier) => Some(FailureNotifier::spawn(broker.subscribe(), notifier)),
            None => {
                warn!("Failure notifications disabled");
                None
            }
        };

        if storage.is_none() {
            warn!("No storage connection string configured, upload jobs will fail");
        }
        if config.instagram.whitelist.is_empty() {
            warn!("Whitelist is empty, no stories will be fetched");
        }

        let stages = &config.stages;
        let sink: Arc<dyn JobSink> = Arc::new(broker.clone());

        let fetch = FetchHandler::new(
            source,
            SessionStore::new(&config.instagram.session_path),
            sink.clone(),
            FetchSettings {
                whitelist: Whitelist::new(config.instagram.whitelist.iter().cloned()),
                concurrency: stages.fetch.concurrency,
                download_options: stages.download.job_options(),
            },
        );
        let download = DownloadHandler::new(
            http,
            &config.download.root,
            stages.download.concurrency,
            sink,
            stages.upload.job_options(),
        );
        let upload = UploadHandler::new(storage, stages.upload.concurrency);

        broker.process(Stage::Fetch, Arc::new(fetch)).await?;
        broker.process(Stage::Download, Arc::new(download)).await?;
        broker.process(Stage::Upload, Arc::new(upload)).await?;

        if config.schedule.enabled {
            Scheduler::new(broker.clone())
                .schedule_fetch(
                    &config.schedule.cron,
                    &config.schedule.timezone,
                    stages.fetch.max_attempts,
                    stages.fetch.timeout(),
                )
                .await?;
        } else {
            info!("Fetch schedule disabled");
        }

        info!("Pipeline started");
        Ok(Self { broker, notifier })
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Stop claiming jobs, wait for running handlers and stop the notifier
    pub async fn shutdown(self) -> Result<()> {
        self.broker.shutdown().await?;
        if let Some(task) = self.notifier {
            task.abort();
        }
        info!("Pipeline stopped");
        Ok(())
    }
}
