//! Resolution of feed items to cache keys.

use std::collections::HashMap;

use url::Url;

use crate::caching::{CacheKey, normalize_url};
use crate::types::{FeedItem, MediaKind, PostId};

/// A feed item's media, resolved to its normalized URL and cache identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub key: CacheKey,
    pub url: Url,
    pub kind: MediaKind,
}

impl ResolvedAsset {
    /// Resolves the media of `item`.
    ///
    /// Fails if the media URL cannot be parsed. Such items can still be streamed by the
    /// playback surface, but are never prefetched.
    pub fn from_item(item: &FeedItem) -> Result<Self, url::ParseError> {
        let url = normalize_url(&item.media_url)?;
        let key = CacheKey::for_media(&url, item.media_kind, item.fingerprint.as_deref());
        Ok(Self {
            key,
            url,
            kind: item.media_kind,
        })
    }
}

#[derive(Debug)]
struct CatalogEntry {
    media_url: String,
    fingerprint: Option<String>,
    asset: Option<ResolvedAsset>,
    last_seen: u64,
}

impl CatalogEntry {
    fn matches(&self, item: &FeedItem) -> bool {
        self.media_url == item.media_url && self.fingerprint == item.fingerprint
    }
}

/// What the catalog knows about a post.
#[derive(Debug, Clone, Copy)]
pub struct CatalogLookup<'a> {
    /// The media URL exactly as the feed handed it out.
    pub media_url: &'a str,
    /// The resolved asset, `None` if the URL could not be parsed.
    pub asset: Option<&'a ResolvedAsset>,
}

/// Maps the posts seen in the feed to their assets.
///
/// Key derivation is memoized per post, and only redone when the post's media URL or
/// fingerprint changes.
#[derive(Debug, Default)]
pub struct AssetCatalog {
    entries: HashMap<PostId, CatalogEntry>,
}

impl AssetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records all `items` as seen in `generation`.
    pub fn observe(&mut self, items: &[FeedItem], generation: u64) {
        for item in items {
            if let Some(entry) = self.entries.get_mut(&item.post_id) {
                if entry.matches(item) {
                    entry.last_seen = generation;
                    continue;
                }
            }

            let asset = match ResolvedAsset::from_item(item) {
                Ok(asset) => Some(asset),
                Err(error) => {
                    tracing::debug!(
                        post_id = %item.post_id,
                        media_url = %item.media_url,
                        %error,
                        "unparseable media url, post will not be prefetched"
                    );
                    None
                }
            };
            self.entries.insert(
                item.post_id.clone(),
                CatalogEntry {
                    media_url: item.media_url.clone(),
                    fingerprint: item.fingerprint.clone(),
                    asset,
                    last_seen: generation,
                },
            );
        }
    }

    /// Drops posts that were not seen in `generation`, unless `keep` holds for their key.
    pub fn prune(&mut self, generation: u64, keep: impl Fn(&CacheKey) -> bool) {
        self.entries.retain(|_, entry| {
            entry.last_seen >= generation || entry.asset.as_ref().is_some_and(|a| keep(&a.key))
        });
    }

    pub fn get(&self, post_id: &PostId) -> Option<CatalogLookup<'_>> {
        self.entries.get(post_id).map(|entry| CatalogLookup {
            media_url: &entry.media_url,
            asset: entry.asset.as_ref(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
