use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ItemId {
    fn from(value: i64) -> Self {
        ItemId(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    LivePhoto,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::LivePhoto => "live_photo",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "live_photo" => Some(MediaKind::LivePhoto),
            _ => None,
        }
    }

    /// Guesses the kind from a file extension; `None` for non-media files.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "heif" | "tif" | "tiff" | "bmp"
            | "avif" => Some(MediaKind::Image),
            "mp4" | "mov" | "m4v" | "mkv" | "webm" | "avi" | "3gp" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// Snapshot of a local media item as handed to the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub id: ItemId,
    pub owner_id: i64,
    pub title: String,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub modified: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("session token is required to sync items")]
    MissingToken,
}

/// Caller identity attached to every sync context.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub session_token: String,
    pub user_id: i64,
    pub user_agent: String,
}

impl Identity {
    pub fn new(
        session_token: impl Into<String>,
        user_id: i64,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            session_token: session_token.into(),
            user_id,
            user_agent: user_agent.into(),
        }
    }

    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.session_token.trim().is_empty() {
            return Err(IdentityError::MissingToken);
        }
        Ok(())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("session_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}
