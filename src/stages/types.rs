//! Story data carried between stages and the path rules applied to it

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::traits::StageError;

/// One downloadable media item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub url: String,
    /// Capture time, Unix seconds
    pub taken_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    Other,
}

impl MediaKind {
    pub fn from_media_type(media_type: i64) -> Self {
        match media_type {
            1 => MediaKind::Photo,
            2 => MediaKind::Video,
            _ => MediaKind::Other,
        }
    }
}

/// Raw story item as reported by the story source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryItem {
    pub kind: MediaKind,
    pub url: Option<String>,
    pub taken_at: Option<i64>,
}

/// All current story assets of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub username: String,
    pub images: Vec<Asset>,
    pub videos: Vec<Asset>,
}

impl Story {
    /// Partition raw items into images and videos, keeping source order
    ///
    /// Items without a URL or a capture time are dropped, as are media kinds
    /// other than photo and video.
    pub fn from_items(username: impl Into<String>, items: Vec<StoryItem>) -> Self {
        let mut images = Vec::new();
        let mut videos = Vec::new();

        for item in items {
            let (Some(url), Some(taken_at)) = (item.url, item.taken_at) else {
                continue;
            };
            let asset = Asset { url, taken_at };
            match item.kind {
                MediaKind::Photo => images.push(asset),
                MediaKind::Video => videos.push(asset),
                MediaKind::Other => {}
            }
        }

        Self {
            username: username.into(),
            images,
            videos,
        }
    }

    /// Images first, then videos
    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.images.iter().chain(self.videos.iter())
    }

    pub fn asset_count(&self) -> usize {
        self.images.len() + self.videos.len()
    }
}

/// A file written by the download stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub username: String,
}

/// `yyyy_MM_dd__HH_mm` (UTC) of the capture time plus the URL path's extension
pub fn asset_filename(asset: &Asset) -> Result<String, StageError> {
    let taken_at = Utc
        .timestamp_opt(asset.taken_at, 0)
        .single()
        .ok_or_else(|| StageError::Validation(format!("invalid capture time {}", asset.taken_at)))?;
    let url = Url::parse(&asset.url)
        .map_err(|e| StageError::Validation(format!("invalid asset url '{}': {e}", asset.url)))?;

    Ok(format!(
        "{}{}",
        taken_at.format("%Y_%m_%d__%H_%M"),
        url_extension(&url)
    ))
}

/// Extension of the last URL path segment including the dot, or empty
fn url_extension(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    Path::new(last)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

/// `<root>/<username>/<filename>`
pub fn local_path_for(root: &Path, username: &str, asset: &Asset) -> Result<PathBuf, StageError> {
    validate_username(username)?;
    Ok(root.join(username).join(asset_filename(asset)?))
}

fn validate_username(username: &str) -> Result<(), StageError> {
    let bad = username.is_empty()
        || username == "."
        || username == ".."
        || username.contains(['/', '\\']);
    if bad {
        return Err(StageError::Validation(format!("unusable username '{username}'")));
    }
    Ok(())
}

/// Remote object path: the last two segments of a local path (`username/filename`)
pub fn remote_path_for(path: &Path) -> Option<String> {
    let filename = path.file_name()?.to_str()?;
    let username = path.parent()?.file_name()?.to_str()?;
    Some(format!("{username}/{filename}"))
}

/// Usernames whose stories are harvested; empty means nobody
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist(BTreeSet<String>);

impl Whitelist {
    pub fn new<I, S>(usernames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(usernames.into_iter().map(Into::into).collect())
    }

    pub fn from_csv(csv: &str) -> Self {
        Self::new(
            csv.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty()),
        )
    }

    pub fn includes(&self, username: &str) -> bool {
        self.0.contains(username)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
