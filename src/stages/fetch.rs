use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::traits::{StageError, StageHandler};
use super::types::{Story, Whitelist};
use crate::instagram::{AuthError, Reply, Session, SessionStore, StorySource, TrayUser};
use crate::pool;
use crate::queue::{Job, JobOptions, JobPayload, JobSink, Stage};

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub whitelist: Whitelist,
    /// Users whose stories are requested at the same time
    pub concurrency: usize,
    pub download_options: JobOptions,
}

/// Logs in, collects the stories of whitelisted users and enqueues one download job
pub struct FetchHandler {
    source: Arc<dyn StorySource>,
    sessions: SessionStore,
    sink: Arc<dyn JobSink>,
    settings: FetchSettings,
}

impl FetchHandler {
    pub fn new(
        source: Arc<dyn StorySource>,
        sessions: SessionStore,
        sink: Arc<dyn JobSink>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            source,
            sessions,
            sink,
            settings,
        }
    }

    async fn collect(&self, saved: Session) -> (Session, Result<Vec<Story>, StageError>) {
        let mut session = match self.source.login(saved.clone()).await {
            Ok(session) => session,
            Err(e) => return (saved, Err(e.into())),
        };

        match get_stories(
            self.source.clone(),
            &session,
            &self.settings.whitelist,
            self.settings.concurrency,
        )
        .await
        {
            Ok(reply) => {
                session.merge(reply.session);
                (session, Ok(reply.value))
            }
            Err(e) => (session, Err(e.into())),
        }
    }
}

/// Stories of every tray user the whitelist includes, in tray order
pub async fn get_stories(
    source: Arc<dyn StorySource>,
    session: &Session,
    whitelist: &Whitelist,
    concurrency: usize,
) -> Result<Reply<Vec<Story>>, AuthError> {
    let tray = source.reels_tray(session).await?;
    let mut session = tray.session;

    let total = tray.value.len();
    let users: Vec<TrayUser> = tray
        .value
        .into_iter()
        .filter(|user| whitelist.includes(&user.username))
        .collect();
    debug!(tray = total, included = users.len(), "Filtered story tray");

    let replies = pool::run(users, concurrency, |user| {
        let source = source.clone();
        let session = session.clone();
        async move {
            let reply = source.user_story(&session, &user).await?;
            Ok::<_, AuthError>(Reply {
                value: Story::from_items(user.username, reply.value),
                session: reply.session,
            })
        }
    })
    .await?;

    let mut stories = Vec::with_capacity(replies.len());
    for reply in replies {
        session.merge(reply.session);
        stories.push(reply.value);
    }

    Ok(Reply {
        value: stories,
        session,
    })
}

#[async_trait]
impl StageHandler for FetchHandler {
    async fn handle(&self, job: &Job) -> Result<(), StageError> {
        if !matches!(job.payload, JobPayload::Fetch) {
            return Err(StageError::UnexpectedPayload(Stage::Fetch));
        }

        let stories = self.sessions.scoped(|saved| self.collect(saved)).await?;

        let users = stories.len();
        let assets: usize = stories.iter().map(Story::asset_count).sum();
        if assets == 0 {
            info!(users, "No story assets to download");
            return Ok(());
        }

        let next = self
            .sink
            .enqueue(
                JobPayload::Download { stories },
                self.settings.download_options.clone(),
            )
            .await?;

        info!(download_job = next.id, users, assets, "Download job enqueued");
        Ok(())
    }
}
