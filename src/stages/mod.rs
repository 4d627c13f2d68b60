//! Pipeline stages: fetch → download → upload
//!
//! Each handler does the I/O of one stage and hands its output to the next
//! stage by enqueueing a job through a [`JobSink`](crate::queue::JobSink).

pub mod download;
pub mod fetch;
mod traits;
pub mod types;
pub mod upload;

pub use download::DownloadHandler;
pub use fetch::{FetchHandler, FetchSettings, get_stories};
pub use traits::{StageError, StageHandler};
pub use types::{Asset, DownloadResult, MediaKind, Story, StoryItem, Whitelist};
pub use upload::UploadHandler;
