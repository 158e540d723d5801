//! Computation of the prefetch window around the active feed position.
//!
//! This is a pure function of the feed position and the configuration. It performs no I/O and
//! does not look at the cache.

use std::collections::HashSet;

use crate::caching::CacheKey;
use crate::config::{ActiveItemPolicy, PrefetchConfig};
use crate::types::{FeedItem, Priority, ScrollDirection};

use super::catalog::ResolvedAsset;

/// The parameters shaping a [`PrefetchWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOptions {
    pub forward_count: usize,
    pub backward_count: usize,
    pub direction_weighting: bool,
    pub active_item: ActiveItemPolicy,
}

impl From<&PrefetchConfig> for WindowOptions {
    fn from(config: &PrefetchConfig) -> Self {
        Self {
            forward_count: config.forward_count,
            backward_count: config.backward_count,
            direction_weighting: config.direction_weighting,
            active_item: config.active_item,
        }
    }
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self::from(&PrefetchConfig::default())
    }
}

/// One item of the prefetch window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSlot {
    /// Index of the item in the feed list.
    pub index: usize,
    pub asset: ResolvedAsset,
    pub priority: Priority,
}

/// The set of assets that should be resident for the current feed position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchWindow {
    slots: Vec<WindowSlot>,
    retained: Option<ResolvedAsset>,
}

impl PrefetchWindow {
    /// The window items, most urgent first.
    ///
    /// Priorities are strictly decreasing and keys are unique.
    pub fn slots(&self) -> &[WindowSlot] {
        &self.slots
    }

    /// The active item, if it is streamed rather than fetched.
    ///
    /// A copy of the retained asset that is already resident or in flight is kept, but it is
    /// never newly requested.
    pub fn retained(&self) -> Option<&ResolvedAsset> {
        self.retained.as_ref()
    }

    /// Whether `key` is fetched or retained by this window.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots.iter().any(|slot| slot.asset.key == *key)
            || self.retained.as_ref().is_some_and(|asset| asset.key == *key)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.retained.is_none()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Computes the prefetch window for the item at `active_index`.
///
/// The window covers `[active - backward_count, active + forward_count]` clamped to the list.
/// Items are ranked by distance to the active item. At equal distance, the item in the
/// direction of travel ranks first, and when there is no direction or direction weighting is
/// disabled, the item ahead ranks first.
///
/// Without an active item, or with an active index past the end of `items`, the window is
/// empty. Items whose media URL cannot be parsed are skipped.
pub fn compute_window(
    active_index: Option<usize>,
    items: &[FeedItem],
    direction: ScrollDirection,
    options: &WindowOptions,
) -> PrefetchWindow {
    let Some(active) = active_index.filter(|index| *index < items.len()) else {
        return PrefetchWindow::default();
    };

    let start = active.saturating_sub(options.backward_count);
    let end = active.saturating_add(options.forward_count).min(items.len() - 1);
    let backward_first = options.direction_weighting && direction == ScrollDirection::Backward;

    let mut ranked: Vec<_> = (start..=end)
        .filter(|index| *index != active || options.active_item == ActiveItemPolicy::Cache)
        .map(|index| {
            let distance = index.abs_diff(active);
            let is_behind = index < active;
            let tie_break = is_behind != backward_first;
            (distance, tie_break, index)
        })
        .collect();
    ranked.sort_unstable();

    let mut seen = HashSet::new();
    let mut slots = Vec::with_capacity(ranked.len());
    for (_, _, index) in ranked {
        let Some(asset) = resolve(&items[index]) else {
            continue;
        };
        // two posts may share the same media
        if seen.insert(asset.key.clone()) {
            slots.push((index, asset));
        }
    }

    let count = slots.len() as u32;
    let slots = slots
        .into_iter()
        .enumerate()
        .map(|(rank, (index, asset))| WindowSlot {
            index,
            asset,
            priority: Priority(count - rank as u32),
        })
        .collect();

    let retained = match options.active_item {
        ActiveItemPolicy::Stream => {
            resolve(&items[active]).filter(|asset| !seen.contains(&asset.key))
        }
        ActiveItemPolicy::Cache => None,
    };

    PrefetchWindow { slots, retained }
}

fn resolve(item: &FeedItem) -> Option<ResolvedAsset> {
    match ResolvedAsset::from_item(item) {
        Ok(asset) => Some(asset),
        Err(error) => {
            tracing::debug!(post_id = %item.post_id, %error, "skipping item with invalid media url");
            None
        }
    }
}
