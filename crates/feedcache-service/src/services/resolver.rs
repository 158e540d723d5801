//! Answers the playback surface's question "where are the bytes for this post?".

use std::path::PathBuf;

use crate::types::{FeedItem, PostId};

use super::catalog::ResolvedAsset;
use super::{SharedResources, lock};

/// Where to play a post's media from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    /// A complete local copy.
    Local(PathBuf),
    /// The media URL exactly as the feed handed it out.
    Remote(String),
}

impl PlaybackSource {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

/// Resolves posts to a [`PlaybackSource`].
///
/// Resolution never blocks on downloads and never starts one. Anything that is not resident
/// right now resolves to the remote URL. The lock it shares with the scheduler is never held
/// across file-system work.
#[derive(Debug, Clone)]
pub struct PlaybackResolver {
    resources: SharedResources,
}

impl PlaybackResolver {
    pub fn new(resources: SharedResources) -> Self {
        Self { resources }
    }

    /// Resolves a post seen in the feed.
    ///
    /// Returns `None` only for posts that were never part of a position update.
    pub fn resolve(&self, post_id: &PostId) -> Option<PlaybackSource> {
        let resources = lock(&self.resources);
        let lookup = resources.catalog.get(post_id)?;

        let local = lookup
            .asset
            .and_then(|asset| resources.store.get(&asset.key));
        let source = match local {
            Some(path) => PlaybackSource::Local(path.to_owned()),
            None => PlaybackSource::Remote(lookup.media_url.to_owned()),
        };
        record(&source);

        Some(source)
    }

    /// Resolves `item`, whether or not it was seen in the feed.
    pub fn resolve_item(&self, item: &FeedItem) -> PlaybackSource {
        let local = ResolvedAsset::from_item(item).ok().and_then(|asset| {
            let resources = lock(&self.resources);
            resources.store.get(&asset.key).map(|path| path.to_owned())
        });

        let source = match local {
            Some(path) => PlaybackSource::Local(path),
            None => PlaybackSource::Remote(item.media_url.clone()),
        };
        record(&source);

        source
    }

    /// Whether the post's media is resident.
    pub fn is_cached(&self, post_id: &PostId) -> bool {
        let resources = lock(&self.resources);
        resources
            .catalog
            .get(post_id)
            .and_then(|lookup| lookup.asset)
            .is_some_and(|asset| resources.store.has(&asset.key))
    }
}

fn record(source: &PlaybackSource) {
    let source = match source {
        PlaybackSource::Local(_) => "local",
        PlaybackSource::Remote(_) => "remote",
    };
    metric!(counter("resolve") += 1, "source" => source);
}
