//! Wire formats of the private story API

use std::fmt;

use serde::Deserialize;

use crate::stages::types::{MediaKind, StoryItem};

/// A user appearing in the story tray
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrayUser {
    pub pk: String,
    pub username: String,
}

/// User ids arrive as numbers or strings depending on the endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Pk {
    Number(u64),
    Text(String),
}

impl fmt::Display for Pk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pk::Number(n) => write!(f, "{n}"),
            Pk::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginResponse {
    #[serde(default)]
    pub logged_in_user: Option<LoggedInUser>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoggedInUser {
    pub pk: Pk,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReelsTrayResponse {
    #[serde(default)]
    pub tray: Vec<TrayEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TrayEntry {
    pub user: WireUser,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUser {
    pub pk: Pk,
    pub username: String,
}

impl From<TrayEntry> for TrayUser {
    fn from(entry: TrayEntry) -> Self {
        TrayUser {
            pk: entry.user.pk.to_string(),
            username: entry.user.username,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserStoryResponse {
    #[serde(default)]
    pub reel: Option<Reel>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Reel {
    #[serde(default)]
    pub items: Vec<WireItem>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireItem {
    pub media_type: i64,
    #[serde(default)]
    pub taken_at: Option<i64>,
    #[serde(default)]
    pub image_versions2: Option<ImageVersions>,
    #[serde(default)]
    pub video_versions: Vec<MediaVersion>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ImageVersions {
    #[serde(default)]
    pub candidates: Vec<MediaVersion>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MediaVersion {
    pub url: String,
}

impl From<WireItem> for StoryItem {
    fn from(item: WireItem) -> Self {
        let kind = MediaKind::from_media_type(item.media_type);
        // First candidate / version is the highest resolution
        let url = match kind {
            MediaKind::Photo => item
                .image_versions2
                .and_then(|versions| versions.candidates.into_iter().next())
                .map(|c| c.url),
            MediaKind::Video => item.video_versions.into_iter().next().map(|v| v.url),
            MediaKind::Other => None,
        };
        StoryItem {
            kind,
            url,
            taken_at: item.taken_at,
        }
    }
}

impl UserStoryResponse {
    pub fn into_items(self) -> Vec<StoryItem> {
        self.reel
            .unwrap_or_default()
            .items
            .into_iter()
            .map(StoryItem::from)
            .collect()
    }
}
