use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifier of a post in the feed, as handed out by the feed source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(Arc<str>);

impl PostId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PostId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PostId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The kind of media attached to a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Image,
}

impl MediaKind {
    /// File extension used when the media URL carries none.
    pub fn default_extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Image => "jpg",
        }
    }
}

impl AsRef<str> for MediaKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::Video => "video",
            Self::Image => "image",
        }
    }
}

/// A single post as observed from the feed source.
///
/// Items are owned by the feed source and handed in on every position update. The core only
/// reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub post_id: PostId,
    pub media_url: String,
    pub media_kind: MediaKind,
    /// An optional content fingerprint (ETag, length or version) supplied by the feed API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl FeedItem {
    pub fn new(post_id: impl Into<PostId>, media_url: impl Into<String>, media_kind: MediaKind) -> Self {
        Self {
            post_id: post_id.into(),
            media_url: media_url.into(),
            media_kind,
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// The direction the feed is currently travelling in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Forward,
    Backward,
    #[default]
    None,
}

/// Fetch priority of a download. Higher values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u32);

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
