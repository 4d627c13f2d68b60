//! Story source: authenticated session, story tray and per-user stories

mod client;
mod models;
mod session;

pub use client::{Credentials, InstagramClient, InstagramConfig};
pub use models::TrayUser;
pub use session::{Reply, Session, SessionStore};

use async_trait::async_trait;
use thiserror::Error;

use crate::stages::types::StoryItem;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("story source credentials are not configured")]
    MissingCredentials,

    #[error("rejected by story source: {0}")]
    Rejected(String),

    #[error("story source request failed: {0}")]
    Request(String),

    #[error("unexpected story source response: {0}")]
    Decode(String),
}

/// Session-based access to the story feed
///
/// Calls take the current session and return the session they ended with,
/// so callers decide when state gets persisted.
#[async_trait]
pub trait StorySource: Send + Sync {
    /// Turn a saved (possibly empty) session into an authenticated one
    async fn login(&self, saved: Session) -> Result<Session, AuthError>;

    async fn reels_tray(&self, session: &Session) -> Result<Reply<Vec<TrayUser>>, AuthError>;

    async fn user_story(&self, session: &Session, user: &TrayUser) -> Result<Reply<Vec<StoryItem>>, AuthError>;
}
